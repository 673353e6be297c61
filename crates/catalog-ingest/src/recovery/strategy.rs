//! Recovery strategy table and retry delays

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classify::ErrorType;
use super::RecoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    DelayedRetry,
    /// Wait a fixed delay for a referenced entity to appear
    DependencyRetry,
    /// Keep the rest of the batch, report the row for manual fixing
    PartialRecovery,
    ManualIntervention,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::ImmediateRetry => "immediate_retry",
            RecoveryStrategy::DelayedRetry => "delayed_retry",
            RecoveryStrategy::DependencyRetry => "dependency_retry",
            RecoveryStrategy::PartialRecovery => "partial_recovery",
            RecoveryStrategy::ManualIntervention => "manual_intervention",
        }
    }

    pub fn retries(&self) -> bool {
        matches!(
            self,
            RecoveryStrategy::ImmediateRetry
                | RecoveryStrategy::DelayedRetry
                | RecoveryStrategy::DependencyRetry
        )
    }
}

/// Strategy for the given failure and 1-based attempt number
pub fn select_strategy(error_type: ErrorType, attempt: u32) -> RecoveryStrategy {
    match error_type {
        ErrorType::Network | ErrorType::Timeout if attempt <= 2 => RecoveryStrategy::ImmediateRetry,
        ErrorType::Network | ErrorType::Timeout => RecoveryStrategy::DelayedRetry,
        ErrorType::Memory => RecoveryStrategy::DelayedRetry,
        ErrorType::Dependency => RecoveryStrategy::DependencyRetry,
        ErrorType::Database if attempt <= 1 => RecoveryStrategy::ImmediateRetry,
        ErrorType::Database => RecoveryStrategy::DelayedRetry,
        ErrorType::Validation | ErrorType::BusinessLogic => RecoveryStrategy::PartialRecovery,
        ErrorType::Unknown => RecoveryStrategy::ManualIntervention,
    }
}

/// `min(base * 2^(attempt-1), max)`, or `base` without exponential backoff
pub fn compute_backoff(config: &RecoveryConfig, attempt: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let max_ms = config.max_backoff_delay.as_millis() as u64;
    if !config.exponential_backoff {
        return Duration::from_millis(base_ms.min(max_ms));
    }
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Delay before the retry chosen by `strategy`
pub fn retry_delay(config: &RecoveryConfig, strategy: RecoveryStrategy, attempt: u32) -> Duration {
    match strategy {
        RecoveryStrategy::DependencyRetry => config.dependency_retry_delay,
        _ => compute_backoff(config, attempt),
    }
}
