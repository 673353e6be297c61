//! Row write state machine
//!
//! `new -> in flight -> { succeeded | failed -> retry scheduled -> in flight | dead-lettered }`
//!
//! All per-row bookkeeping (ledger, failed rows, counters) sits behind one
//! mutex so a checkpoint always sees a consistent picture. The dead-letter
//! queue, slot pool and entity registry each guard their own state; when two
//! locks are held the book is always taken first.

use catalog_common::types::RowIndex;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::checkpoint::{CheckpointStore, RecoveryCheckpoint};
use super::classify::{ErrorType, FailureSeverity};
use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use super::dependency::{defined_key, DependencyMap, EntityRegistry};
use super::ledger::{RowLedger, RowState};
use super::scheduler::RetryScheduler;
use super::strategy::{retry_delay, RecoveryStrategy};
use super::{FailedRow, RecoveryConfig, RecoveryResult};
use crate::error::{Result, WriteError};
use crate::metrics::{MetricsHandle, RowEventKind};
use crate::resource::{SlotPermit, SlotPool};
use crate::types::{Batch, RawRecord, ValidatedRow};
use crate::validation::RowValidator;
use crate::writer::{DomainWriter, WriteResult};

/// Final status of a row as reported in job artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Succeeded,
    Failed,
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub row_index: RowIndex,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

/// Job-wide counters kept by the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryTotals {
    pub processed_rows: u64,
    pub rejected_rows: u64,
    pub succeeded: u64,
    /// Rows currently in the failed map
    pub failed: u64,
    pub dead_lettered: u64,
    pub pending_retries: u64,
}

#[derive(Debug, Default)]
struct RecoveryBook {
    ledger: RowLedger,
    failed: BTreeMap<RowIndex, FailedRow>,
    /// Succeeded outcomes not yet taken by the report stream
    successes: Vec<RowOutcome>,
    successful_rows: u64,
    processed_rows: u64,
    rejected_rows: u64,
    rows_since_checkpoint: u64,
    /// Keys whose defining row is failed or dead-lettered
    failed_definers: HashMap<String, RowIndex>,
    dependency_snapshot: BTreeMap<String, Vec<RowIndex>>,
}

/// What happened to a row on one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Succeeded,
    RetryScheduled,
    Failed,
    DeadLettered,
    /// The ledger refused the transition; nothing was attempted
    Skipped,
}

impl AttemptOutcome {
    fn absorb_into(self, result: &mut RecoveryResult) {
        match self {
            AttemptOutcome::Succeeded => result.recovered_rows += 1,
            AttemptOutcome::RetryScheduled => result.scheduled_retries += 1,
            AttemptOutcome::Failed => result.permanent_failures += 1,
            AttemptOutcome::DeadLettered => result.dead_letter_rows += 1,
            AttemptOutcome::Skipped => {}
        }
    }
}

enum FailureDecision {
    Retry(std::time::Duration, RecoveryStrategy),
    GiveUp(FailureSeverity),
    DeadLetter,
}

struct Inner {
    job_id: Uuid,
    config: RecoveryConfig,
    book: Mutex<RecoveryBook>,
    dead_letters: DeadLetterQueue,
    registry: Arc<EntityRegistry>,
    slots: Arc<SlotPool>,
    scheduler: RetryScheduler,
    store: Arc<dyn CheckpointStore>,
    checkpoint_tasks: TaskTracker,
    last_checkpoint: Mutex<Option<Uuid>>,
    metrics: Option<MetricsHandle>,
    cancel: CancellationToken,
}

pub struct RecoveryManagerBuilder {
    job_id: Uuid,
    config: RecoveryConfig,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
    slots: Option<Arc<SlotPool>>,
    registry: Option<Arc<EntityRegistry>>,
    metrics: Option<MetricsHandle>,
}

impl RecoveryManagerBuilder {
    pub fn slots(mut self, slots: Arc<SlotPool>) -> Self {
        self.slots = Some(slots);
        self
    }

    pub fn registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> RecoveryManager {
        RecoveryManager {
            inner: Arc::new(Inner {
                job_id: self.job_id,
                book: Mutex::new(RecoveryBook::default()),
                dead_letters: DeadLetterQueue::new(),
                registry: self.registry.unwrap_or_default(),
                slots: self
                    .slots
                    .unwrap_or_else(|| SlotPool::new(num_cpus::get().clamp(1, 20))),
                scheduler: RetryScheduler::new(self.cancel.clone()),
                store: self.store,
                checkpoint_tasks: TaskTracker::new(),
                last_checkpoint: Mutex::new(None),
                metrics: self.metrics,
                cancel: self.cancel,
                config: self.config,
            }),
        }
    }
}

/// Orders, writes, retries and checkpoints rows for one job
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RecoveryManager {
    inner: Arc<Inner>,
}

impl RecoveryManager {
    pub fn builder(
        job_id: Uuid,
        config: RecoveryConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> RecoveryManagerBuilder {
        RecoveryManagerBuilder {
            job_id,
            config,
            store,
            cancel: CancellationToken::new(),
            slots: None,
            registry: None,
            metrics: None,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.inner.job_id
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    fn book(&self) -> MutexGuard<'_, RecoveryBook> {
        self.inner.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Write every row of a batch in dependency order
    ///
    /// Rows run concurrently up to the slot pool size; a row referencing a key
    /// defined earlier in the batch waits for that row to finish first, and
    /// only then asks for a slot.
    /// Returns once every row had its first attempt. Retries continue in the
    /// background until [`Self::drain`].
    #[instrument(skip_all, fields(job_id = %self.inner.job_id, batch_index = batch.batch_index, rows = batch.rows.len()))]
    pub async fn process_batch(
        &self,
        batch: &Batch,
        writer: Arc<dyn DomainWriter>,
        validator: Option<&dyn RowValidator>,
    ) -> Result<RecoveryResult> {
        let map = DependencyMap::build(&batch.rows, &self.inner.config.dependencies);
        let order = map.processing_order();

        {
            let mut book = self.book();
            for row in &batch.rows {
                if let Err(e) = book.ledger.admit(row.row_index) {
                    error!(error = %e, "Row admitted twice");
                }
            }
            book.processed_rows += batch.rows.len() as u64;
            book.rejected_rows += batch.rejected_rows() as u64;
            book.rows_since_checkpoint += batch.consumed_rows();
            book.dependency_snapshot = map.snapshot();
        }
        self.inner.slots.enqueue(batch.rows.len());

        let mut done: HashMap<usize, watch::Receiver<Option<bool>>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for pos in order {
            let row = batch.rows[pos].clone();
            let dependencies = map.references(pos).clone();
            let rejection = match validator {
                Some(validator) => revalidate(validator, &row)?,
                None => None,
            };
            // definers later in the order only exist on a cycle; those are not awaited
            let waits: Vec<watch::Receiver<Option<bool>>> = map
                .in_batch_definers(pos)
                .into_iter()
                .filter_map(|(_, definer)| done.get(&definer).cloned())
                .collect();
            let (done_tx, done_rx) = watch::channel(None);
            done.insert(pos, done_rx);

            let manager = self.clone();
            let writer = Arc::clone(&writer);
            tasks.spawn(async move {
                for mut definer in waits {
                    // a closed channel means the definer task died; its row stays failed
                    let _ = definer.wait_for(|state| state.is_some()).await;
                }
                let permit = manager.inner.slots.acquire().await;
                let outcome = if manager.begin(row.row_index) {
                    match rejection {
                        Some(err) => manager.on_failure(row, dependencies, err, 0, permit, writer),
                        None => manager.execute(row, dependencies, writer, permit).await,
                    }
                } else {
                    AttemptOutcome::Skipped
                };
                let _ = done_tx.send(Some(outcome == AttemptOutcome::Succeeded));
                outcome
            });
        }

        let mut result = RecoveryResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcome.absorb_into(&mut result),
                Err(e) => error!(error = %e, "Row task aborted"),
            }
        }

        self.maybe_checkpoint(batch);

        debug!(
            recovered = result.recovered_rows,
            permanent = result.permanent_failures,
            dead_lettered = result.dead_letter_rows,
            retries = result.scheduled_retries,
            "Batch processed"
        );
        Ok(result)
    }

    /// Load a checkpoint, adopt its state, and re-attempt its failed rows
    ///
    /// Rows are retried one at a time, fewest dependencies first, then fewest
    /// attempts, then by severity. Permanent failures are reported, not retried.
    #[instrument(skip(self, writer), fields(job_id = %self.inner.job_id))]
    pub async fn recover_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
        writer: Arc<dyn DomainWriter>,
    ) -> Result<RecoveryResult> {
        let checkpoint = self.inner.store.load(checkpoint_id).await?;
        self.restore(&checkpoint);
        info!(
            batch_index = checkpoint.batch_index,
            failed_rows = checkpoint.failed_rows.len(),
            successful_rows = checkpoint.successful_rows,
            "Recovering from checkpoint"
        );

        let mut candidates = self.failed_rows();
        candidates.sort_by_key(|f| {
            (
                f.dependencies.len(),
                f.attempt_count(),
                f.severity.rank(),
                f.row_index,
            )
        });

        let mut result = RecoveryResult::default();
        for failed in candidates {
            if failed.severity == FailureSeverity::Permanent {
                result.permanent_failures += 1;
                continue;
            }
            if self.inner.cancel.is_cancelled() {
                info!("Recovery cancelled");
                break;
            }
            self.inner.slots.enqueue(1);
            let permit = self.inner.slots.acquire().await;
            if !self.begin(failed.row_index) {
                continue;
            }
            let outcome = self
                .execute(failed.row, failed.dependencies, Arc::clone(&writer), permit)
                .await;
            outcome.absorb_into(&mut result);
        }
        Ok(result)
    }

    /// Replace the manager's state with a checkpoint's
    pub fn restore(&self, checkpoint: &RecoveryCheckpoint) {
        let rules = &self.inner.config.dependencies;
        let mut book = self.book();
        *book = RecoveryBook {
            successful_rows: checkpoint.successful_rows,
            processed_rows: checkpoint.processed_rows,
            rejected_rows: checkpoint.rejected_rows,
            dependency_snapshot: checkpoint.dependency_snapshot.clone(),
            ..RecoveryBook::default()
        };
        for failed in &checkpoint.failed_rows {
            book.ledger.restore(failed.row_index, RowState::Failed);
            if let Some(key) = defined_key(&failed.row, rules) {
                book.failed_definers.insert(key, failed.row_index);
            }
            book.failed.insert(failed.row_index, failed.clone());
        }
        for entry in &checkpoint.dead_letters {
            book.ledger
                .restore(entry.failed_row.row_index, RowState::DeadLettered);
            if let Some(key) = defined_key(&entry.failed_row.row, rules) {
                book.failed_definers.insert(key, entry.failed_row.row_index);
            }
        }
        self.inner.dead_letters.restore(checkpoint.dead_letters.clone());
        drop(book);

        for key in &checkpoint.resolved_keys {
            self.inner.registry.register(key.clone());
        }
    }

    /// Move a row into flight; `false` if the ledger refuses
    fn begin(&self, row_index: RowIndex) -> bool {
        match self.book().ledger.transition(row_index, RowState::InFlight) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Refusing to start row");
                false
            }
        }
    }

    /// Attempt one write of an in-flight row
    async fn execute(
        &self,
        row: ValidatedRow,
        dependencies: BTreeSet<String>,
        writer: Arc<dyn DomainWriter>,
        permit: SlotPermit,
    ) -> AttemptOutcome {
        if let Some(err) = self.check_dependencies(&dependencies) {
            return self.on_failure(row, dependencies, err, 0, permit, writer);
        }

        let started = Instant::now();
        let written = self.call_writer(writer.as_ref(), &row).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match written {
            Ok(result) => {
                self.on_success(row, result, duration_ms, permit);
                AttemptOutcome::Succeeded
            }
            Err(err) => self.on_failure(row, dependencies, err, duration_ms, permit, writer),
        }
    }

    /// First unsatisfied reference, as a dependency failure
    ///
    /// A key is satisfied once it is known to the registry. A key whose
    /// defining row failed is unsatisfied. Keys nobody defines are assumed to
    /// exist unless dependencies are strict.
    fn check_dependencies(&self, dependencies: &BTreeSet<String>) -> Option<WriteError> {
        let book = self.book();
        for key in dependencies {
            if self.inner.registry.contains(key) {
                continue;
            }
            if let Some(definer) = book.failed_definers.get(key) {
                return Some(WriteError::typed(
                    ErrorType::Dependency,
                    format!("Dependency '{}' unresolved: defining row {} failed", key, definer),
                ));
            }
            if self.inner.config.dependencies.strict {
                return Some(WriteError::typed(
                    ErrorType::Dependency,
                    format!("Dependency '{}' not found", key),
                ));
            }
        }
        None
    }

    async fn call_writer(
        &self,
        writer: &dyn DomainWriter,
        row: &ValidatedRow,
    ) -> std::result::Result<WriteResult, WriteError> {
        let timeout = self.inner.config.writer_timeout;
        let call = AssertUnwindSafe(writer.write(row)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(WriteError::typed(
                ErrorType::Timeout,
                format!("Writer call timed out after {}ms", timeout.as_millis()),
            )),
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(WriteError::typed(
                    ErrorType::Unknown,
                    format!("Writer panicked: {}", message),
                ))
            }
            Ok(Ok(result)) => result,
        }
    }

    fn on_success(&self, row: ValidatedRow, result: WriteResult, duration_ms: u64, permit: SlotPermit) {
        permit.succeed();
        let row_index = row.row_index;
        let key = defined_key(&row, &self.inner.config.dependencies);
        {
            let mut book = self.book();
            if let Err(e) = book.ledger.transition(row_index, RowState::Succeeded) {
                error!(error = %e, "Ledger rejected success");
            }
            let attempts = book
                .failed
                .remove(&row_index)
                .map(|f| f.attempt_count())
                .unwrap_or(0)
                + 1;
            book.successful_rows += 1;
            book.successes.push(RowOutcome {
                row_index,
                status: RowStatus::Succeeded,
                entity_id: result.entity_id,
                attempts,
                error: None,
                error_type: None,
            });
            if let Some(key) = &key {
                book.failed_definers.remove(key);
            }
        }
        if let Some(key) = key {
            self.inner.registry.register(key);
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_row_processing(RowEventKind::Succeeded, duration_ms);
        }
    }

    fn on_failure(
        &self,
        row: ValidatedRow,
        dependencies: BTreeSet<String>,
        err: WriteError,
        duration_ms: u64,
        permit: SlotPermit,
        writer: Arc<dyn DomainWriter>,
    ) -> AttemptOutcome {
        permit.fail();
        let row_index = row.row_index;
        let error_type = err.classify();
        let config = &self.inner.config;

        let (attempt, decision) = {
            let mut book = self.book();
            if let Err(e) = book.ledger.transition(row_index, RowState::Failed) {
                error!(error = %e, "Ledger rejected failure");
                return AttemptOutcome::Skipped;
            }
            if let Some(key) = defined_key(&row, &config.dependencies) {
                book.failed_definers.insert(key, row_index);
            }

            let failed = book
                .failed
                .entry(row_index)
                .or_insert_with(|| FailedRow::new(row.clone(), dependencies.clone(), error_type));
            failed.dependencies = dependencies;
            let (attempt, strategy) = failed.record_attempt(&err.message, error_type, duration_ms);
            let severity = failed.severity;

            let decision = if attempt >= config.dead_letter_threshold {
                if let Some(failed) = book.failed.remove(&row_index) {
                    if let Err(e) = book.ledger.transition(row_index, RowState::DeadLettered) {
                        error!(error = %e, "Ledger rejected dead-letter");
                    }
                    if !self.inner.dead_letters.push(failed) {
                        warn!(row_index, "Row was already dead-lettered");
                    }
                }
                FailureDecision::DeadLetter
            } else if severity != FailureSeverity::Permanent
                && attempt < config.max_retries
                && strategy != RecoveryStrategy::ManualIntervention
            {
                FailureDecision::Retry(retry_delay(config, strategy, attempt), strategy)
            } else {
                FailureDecision::GiveUp(severity)
            };
            (attempt, decision)
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_error(error_type);
        }

        match decision {
            FailureDecision::DeadLetter => {
                warn!(
                    row_index,
                    attempts = attempt,
                    error_type = %error_type,
                    error = %err,
                    "Row dead-lettered"
                );
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_row_processing(RowEventKind::DeadLettered, duration_ms);
                }
                AttemptOutcome::DeadLettered
            }
            FailureDecision::GiveUp(severity) => {
                warn!(
                    row_index,
                    attempts = attempt,
                    error_type = %error_type,
                    severity = severity.as_str(),
                    error = %err,
                    "Row failed without further retries"
                );
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_row_processing(RowEventKind::Failed, duration_ms);
                }
                AttemptOutcome::Failed
            }
            FailureDecision::Retry(delay, strategy) => {
                if self.schedule_retry(row, delay, writer) {
                    debug!(
                        row_index,
                        attempt,
                        strategy = strategy.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retry scheduled"
                    );
                    AttemptOutcome::RetryScheduled
                } else {
                    info!(row_index, "Job cancelled, retry not scheduled");
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.record_row_processing(RowEventKind::Failed, duration_ms);
                    }
                    AttemptOutcome::Failed
                }
            }
        }
    }

    fn schedule_retry(
        &self,
        row: ValidatedRow,
        delay: std::time::Duration,
        writer: Arc<dyn DomainWriter>,
    ) -> bool {
        let manager = self.clone();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            manager.retry_row(row, writer).await;
        });
        self.inner.scheduler.schedule(delay, task)
    }

    async fn retry_row(&self, row: ValidatedRow, writer: Arc<dyn DomainWriter>) {
        self.inner.slots.enqueue(1);
        let permit = self.inner.slots.acquire().await;
        let dependencies = {
            let book = self.book();
            book.failed.get(&row.row_index).map(|f| f.dependencies.clone())
        };
        let Some(dependencies) = dependencies else {
            debug!(row_index = row.row_index, "Row left the failed set before its retry");
            return;
        };
        if !self.begin(row.row_index) {
            return;
        }
        self.execute(row, dependencies, writer, permit).await;
    }

    fn maybe_checkpoint(&self, batch: &Batch) {
        let interval = self.inner.config.checkpoint_interval_rows;
        let due = {
            let book = self.book();
            interval == 0 || book.rows_since_checkpoint >= interval
        };
        if due {
            let checkpoint = self.build_checkpoint(batch.batch_index, batch.end_row_index);
            self.spawn_save(checkpoint);
        }
    }

    /// Snapshot current state as a checkpoint and reset the row interval
    pub fn build_checkpoint(&self, batch_index: u64, last_row_index: RowIndex) -> RecoveryCheckpoint {
        let mut book = self.book();
        book.rows_since_checkpoint = 0;
        RecoveryCheckpoint {
            id: Uuid::new_v4(),
            job_id: self.inner.job_id,
            timestamp_ms: catalog_common::types::epoch_millis(),
            batch_index,
            last_row_index,
            processed_rows: book.processed_rows,
            rejected_rows: book.rejected_rows,
            successful_rows: book.successful_rows,
            failed_rows: book.failed.values().cloned().collect(),
            dependency_snapshot: book.dependency_snapshot.clone(),
            resolved_keys: self.inner.registry.snapshot(),
            dead_letters: self.inner.dead_letters.entries(),
        }
    }

    fn spawn_save(&self, checkpoint: RecoveryCheckpoint) {
        *self
            .inner
            .last_checkpoint
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(checkpoint.id);
        let store = Arc::clone(&self.inner.store);
        self.inner.checkpoint_tasks.spawn(async move {
            match store.save(&checkpoint).await {
                Ok(()) => debug!(
                    checkpoint_id = %checkpoint.id,
                    batch_index = checkpoint.batch_index,
                    "Checkpoint saved"
                ),
                Err(e) => error!(
                    checkpoint_id = %checkpoint.id,
                    error = %e,
                    "Failed to save checkpoint"
                ),
            }
        });
    }

    /// Build and durably save a checkpoint, waiting for the write
    pub async fn checkpoint(&self, batch_index: u64, last_row_index: RowIndex) -> Result<RecoveryCheckpoint> {
        let checkpoint = self.build_checkpoint(batch_index, last_row_index);
        self.inner.store.save(&checkpoint).await?;
        *self
            .inner
            .last_checkpoint
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(checkpoint.id);
        Ok(checkpoint)
    }

    pub fn last_checkpoint_id(&self) -> Option<Uuid> {
        *self
            .inner
            .last_checkpoint
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Wait for background checkpoint writes
    pub async fn flush_checkpoints(&self) {
        self.inner.checkpoint_tasks.close();
        self.inner.checkpoint_tasks.wait().await;
        self.inner.checkpoint_tasks.reopen();
    }

    /// Wait for every scheduled retry and pending checkpoint write
    pub async fn drain(&self) {
        self.inner.scheduler.drain().await;
        self.flush_checkpoints().await;
    }

    pub fn totals(&self) -> RecoveryTotals {
        let book = self.book();
        RecoveryTotals {
            processed_rows: book.processed_rows,
            rejected_rows: book.rejected_rows,
            succeeded: book.successful_rows,
            failed: book.failed.len() as u64,
            dead_lettered: self.inner.dead_letters.len() as u64,
            pending_retries: self.inner.scheduler.active() as u64,
        }
    }

    pub fn failed_rows(&self) -> Vec<FailedRow> {
        self.book().failed.values().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.entries()
    }

    pub fn row_state(&self, row_index: RowIndex) -> Option<RowState> {
        self.book().ledger.state(row_index)
    }

    pub fn ledger_counts(&self) -> BTreeMap<RowState, usize> {
        self.book().ledger.counts()
    }

    /// Memory actually held by the row ledger, in entries
    pub fn ledger_entries(&self) -> usize {
        self.book().ledger.tracked_entries()
    }

    /// Hand over succeeded outcomes recorded since the last call
    pub fn take_succeeded(&self) -> Vec<RowOutcome> {
        let mut succeeded = std::mem::take(&mut self.book().successes);
        succeeded.sort_by_key(|o| o.row_index);
        succeeded
    }

    /// Outcomes of rows still failed or dead-lettered, ordered by row index
    pub fn unresolved_outcomes(&self) -> Vec<RowOutcome> {
        let book = self.book();
        let mut outcomes: Vec<RowOutcome> = book
            .failed
            .values()
            .map(|f| RowOutcome {
                row_index: f.row_index,
                status: RowStatus::Failed,
                entity_id: None,
                attempts: f.attempt_count(),
                error: Some(f.last_error.clone()),
                error_type: Some(f.error_type),
            })
            .collect();
        outcomes.extend(self.inner.dead_letters.entries().into_iter().map(|e| RowOutcome {
            row_index: e.failed_row.row_index,
            status: RowStatus::DeadLettered,
            entity_id: None,
            attempts: e.failed_row.attempt_count(),
            error: Some(e.failed_row.last_error),
            error_type: Some(e.failed_row.error_type),
        }));
        outcomes.sort_by_key(|o| o.row_index);
        outcomes
    }
}

/// Re-run the row validator on a validated row
///
/// Rejections become validation write errors; a validator error ends the job.
fn revalidate(validator: &dyn RowValidator, row: &ValidatedRow) -> Result<Option<WriteError>> {
    let record = RawRecord::new(row.row_index, row.fields().to_vec());
    let (validated, issues) = validator.validate(&record)?;
    let rejecting: Vec<String> = issues
        .iter()
        .filter(|i| i.severity.rejects_row())
        .map(|i| i.message.clone())
        .collect();
    if validated.is_some() && rejecting.is_empty() {
        return Ok(None);
    }
    let detail = if rejecting.is_empty() {
        "row rejected".to_string()
    } else {
        rejecting.join("; ")
    };
    Ok(Some(WriteError::typed(
        ErrorType::Validation,
        format!("Validation failed: {}", detail),
    )))
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("job_id", &self.inner.job_id)
            .field("totals", &self.totals())
            .finish()
    }
}
