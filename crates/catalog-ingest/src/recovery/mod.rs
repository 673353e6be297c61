//! Dependency ordering, retry and recovery of row writes
//!
//! Every validated row goes through [`RecoveryManager`]: it is ordered after
//! the rows it depends on, written through the [`crate::writer::DomainWriter`],
//! and on failure classified, retried with backoff, dead-lettered, and
//! captured in periodic [`RecoveryCheckpoint`]s.

pub mod checkpoint;
pub mod classify;
pub mod dead_letter;
pub mod dependency;
pub mod ledger;
pub mod manager;
pub mod scheduler;
pub mod strategy;

use catalog_common::types::{epoch_millis, RowIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::AddAssign;
use std::time::Duration;

use crate::config::DependencyRules;
use crate::types::ValidatedRow;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RecoveryCheckpoint};
pub use classify::{classify_error, ErrorType, FailureSeverity};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use dependency::{DependencyMap, EntityRegistry};
pub use ledger::{RowLedger, RowState};
pub use manager::{RecoveryManager, RecoveryManagerBuilder, RecoveryTotals, RowOutcome, RowStatus};
pub use scheduler::RetryScheduler;
pub use strategy::{compute_backoff, retry_delay, select_strategy, RecoveryStrategy};

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_backoff_delay: Duration,
    pub exponential_backoff: bool,
    pub dependency_retry_delay: Duration,
    pub dead_letter_threshold: u32,
    /// Rows between checkpoints; 0 checkpoints after every batch
    pub checkpoint_interval_rows: u64,
    pub writer_timeout: Duration,
    pub dependencies: DependencyRules,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        use crate::config::*;
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_RETRY_DELAY_MS),
            max_backoff_delay: Duration::from_millis(DEFAULT_MAX_BACKOFF_DELAY_MS),
            exponential_backoff: true,
            dependency_retry_delay: Duration::from_millis(DEFAULT_DEPENDENCY_RETRY_DELAY_MS),
            dead_letter_threshold: DEFAULT_DEAD_LETTER_THRESHOLD,
            checkpoint_interval_rows: 0,
            writer_timeout: Duration::from_millis(DEFAULT_WRITER_TIMEOUT_MS),
            dependencies: DependencyRules::default(),
        }
    }
}

/// One failed write attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub timestamp_ms: i64,
    pub error: String,
    pub error_type: ErrorType,
    pub chosen_strategy: RecoveryStrategy,
    pub duration_ms: u64,
}

/// A row whose latest write attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    pub row_index: RowIndex,
    pub row: ValidatedRow,
    pub attempts: Vec<AttemptRecord>,
    pub dependencies: BTreeSet<String>,
    pub last_error: String,
    pub error_type: ErrorType,
    pub severity: FailureSeverity,
}

impl FailedRow {
    pub(crate) fn new(row: ValidatedRow, dependencies: BTreeSet<String>, error_type: ErrorType) -> Self {
        Self {
            row_index: row.row_index,
            row,
            attempts: Vec::new(),
            dependencies,
            last_error: String::new(),
            error_type,
            severity: error_type.severity(),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_strategy(&self) -> Option<RecoveryStrategy> {
        self.attempts.last().map(|a| a.chosen_strategy)
    }

    /// Append an attempt and refresh the summary fields; returns its number
    pub(crate) fn record_attempt(
        &mut self,
        error: &str,
        error_type: ErrorType,
        duration_ms: u64,
    ) -> (u32, RecoveryStrategy) {
        let attempt_number = self.attempt_count() + 1;
        let strategy = select_strategy(error_type, attempt_number);
        self.attempts.push(AttemptRecord {
            attempt_number,
            timestamp_ms: epoch_millis(),
            error: error.to_string(),
            error_type,
            chosen_strategy: strategy,
            duration_ms,
        });
        self.last_error = error.to_string();
        self.error_type = error_type;
        self.severity = error_type.severity();
        (attempt_number, strategy)
    }
}

/// Outcome counts for one `process_batch` or recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub recovered_rows: u64,
    pub permanent_failures: u64,
    pub dead_letter_rows: u64,
    pub scheduled_retries: u64,
}

impl AddAssign for RecoveryResult {
    fn add_assign(&mut self, other: Self) {
        self.recovered_rows += other.recovered_rows;
        self.permanent_failures += other.permanent_failures;
        self.dead_letter_rows += other.dead_letter_rows;
        self.scheduled_retries += other.scheduled_retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_attempt_tracks_strategy_progression() {
        let row = ValidatedRow::new(4, vec![("sku".to_string(), "A".to_string())]);
        let mut failed = FailedRow::new(row, BTreeSet::new(), ErrorType::Network);

        let (n, s) = failed.record_attempt("connection reset", ErrorType::Network, 12);
        assert_eq!((n, s), (1, RecoveryStrategy::ImmediateRetry));
        failed.record_attempt("connection reset", ErrorType::Network, 12);
        let (n, s) = failed.record_attempt("connection reset", ErrorType::Network, 12);
        assert_eq!((n, s), (3, RecoveryStrategy::DelayedRetry));

        assert_eq!(failed.attempt_count(), 3);
        assert_eq!(failed.severity, FailureSeverity::Recoverable);
        assert_eq!(failed.last_strategy(), Some(RecoveryStrategy::DelayedRetry));
    }

    #[test]
    fn test_result_accumulates() {
        let mut total = RecoveryResult::default();
        total += RecoveryResult {
            recovered_rows: 2,
            permanent_failures: 1,
            dead_letter_rows: 0,
            scheduled_retries: 3,
        };
        total += RecoveryResult {
            recovered_rows: 1,
            ..RecoveryResult::default()
        };
        assert_eq!(total.recovered_rows, 3);
        assert_eq!(total.scheduled_retries, 3);
    }
}
