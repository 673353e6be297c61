//! Threshold alerting over [`ImportMetrics`] snapshots

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::collector::ImportMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ErrorRate,
    ProcessingRate,
    ActiveJobs,
    PeakMemoryMb,
    /// Counted as the increase since the previous evaluation
    MemoryCriticalEvents,
    /// Counted as the increase since the previous evaluation
    DeadLetteredRows,
    /// Counted as the increase since the previous evaluation
    FailedRows,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::ErrorRate => "error_rate",
            AlertMetric::ProcessingRate => "processing_rate",
            AlertMetric::ActiveJobs => "active_jobs",
            AlertMetric::PeakMemoryMb => "peak_memory_mb",
            AlertMetric::MemoryCriticalEvents => "memory_critical_events",
            AlertMetric::DeadLetteredRows => "dead_lettered_rows",
            AlertMetric::FailedRows => "failed_rows",
        }
    }

    fn is_counter(&self) -> bool {
        matches!(
            self,
            AlertMetric::MemoryCriticalEvents | AlertMetric::DeadLetteredRows | AlertMetric::FailedRows
        )
    }

    fn read(&self, metrics: &ImportMetrics) -> f64 {
        match self {
            AlertMetric::ErrorRate => metrics.error_rate(),
            AlertMetric::ProcessingRate => metrics.processing_rate,
            AlertMetric::ActiveJobs => metrics.active_jobs as f64,
            AlertMetric::PeakMemoryMb => metrics.peak_memory_mb,
            AlertMetric::MemoryCriticalEvents => metrics.memory_critical_events as f64,
            AlertMetric::DeadLetteredRows => metrics.rows_dead_lettered as f64,
            AlertMetric::FailedRows => metrics.rows_failed as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub operator: Comparison,
    pub threshold: f64,
    /// How long the condition must hold before firing
    pub duration: Duration,
    /// Minimum gap between two firings of this rule
    pub cooldown: Duration,
    pub severity: AlertSeverity,
    /// Only evaluate while at least one job is running
    pub requires_active_job: bool,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, metric: AlertMetric, operator: Comparison, threshold: f64) -> Self {
        Self {
            name: name.into(),
            metric,
            operator,
            threshold,
            duration: Duration::ZERO,
            cooldown: Duration::from_secs(300),
            severity: AlertSeverity::Warning,
            requires_active_job: false,
        }
    }

    pub fn sustained_for(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn while_active(mut self) -> Self {
        self.requires_active_job = true;
        self
    }
}

/// Built-in rule set
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("high_error_rate", AlertMetric::ErrorRate, Comparison::GreaterThan, 0.1)
            .severity(AlertSeverity::Warning)
            .while_active(),
        AlertRule::new("low_processing_rate", AlertMetric::ProcessingRate, Comparison::LessThan, 1.0)
            .sustained_for(Duration::from_secs(120))
            .cooldown(Duration::from_secs(600))
            .severity(AlertSeverity::Info)
            .while_active(),
        AlertRule::new(
            "memory_critical",
            AlertMetric::MemoryCriticalEvents,
            Comparison::GreaterThan,
            0.0,
        )
        .severity(AlertSeverity::Critical),
        AlertRule::new("rows_dead_lettered", AlertMetric::DeadLetteredRows, Comparison::GreaterThan, 0.0)
            .cooldown(Duration::from_secs(900)),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub rule: String,
    pub metric: AlertMetric,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub fired_at_ms: i64,
}

/// Destination for fired alerts
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Writes alerts to the tracing subscriber at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Info => info!(
                rule = %alert.rule, value = alert.value, threshold = alert.threshold,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                rule = %alert.rule, value = alert.value, threshold = alert.threshold,
                "{}", alert.message
            ),
            AlertSeverity::Critical => error!(
                rule = %alert.rule, value = alert.value, threshold = alert.threshold,
                "{}", alert.message
            ),
        }
    }
}

#[derive(Debug, Default)]
struct RuleState {
    condition_since: Option<Instant>,
    last_fired: Option<Instant>,
    last_counter: Option<f64>,
}

pub struct AlertManager {
    rules: Vec<AlertRule>,
    sinks: Vec<Arc<dyn AlertSink>>,
    state: Mutex<HashMap<String, RuleState>>,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            sinks: Vec::new(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn evaluate(&self, metrics: &ImportMetrics) -> Vec<Alert> {
        self.evaluate_at(metrics, Instant::now())
    }

    /// Evaluate every rule against a snapshot taken at `now`
    pub fn evaluate_at(&self, metrics: &ImportMetrics, now: Instant) -> Vec<Alert> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut fired = Vec::new();

        for rule in &self.rules {
            let entry = state.entry(rule.name.clone()).or_default();
            let raw = rule.metric.read(metrics);
            let value = if rule.metric.is_counter() {
                let delta = raw - entry.last_counter.unwrap_or(0.0);
                entry.last_counter = Some(raw);
                delta
            } else {
                raw
            };

            let applicable = !rule.requires_active_job || metrics.active_jobs > 0;
            if !applicable || !rule.operator.holds(value, rule.threshold) {
                entry.condition_since = None;
                continue;
            }

            let since = *entry.condition_since.get_or_insert(now);
            if now.saturating_duration_since(since) < rule.duration {
                continue;
            }
            if let Some(last) = entry.last_fired {
                if now.saturating_duration_since(last) < rule.cooldown {
                    continue;
                }
            }
            entry.last_fired = Some(now);

            fired.push(Alert {
                rule: rule.name.clone(),
                metric: rule.metric,
                severity: rule.severity,
                value,
                threshold: rule.threshold,
                message: format!(
                    "Alert '{}': {} is {:.3} ({:?} {})",
                    rule.name,
                    rule.metric.as_str(),
                    value,
                    rule.operator,
                    rule.threshold
                ),
                fired_at_ms: catalog_common::types::epoch_millis(),
            });
        }
        drop(state);

        for alert in &fired {
            for sink in &self.sinks {
                sink.emit(alert);
            }
        }
        fired
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("rules", &self.rules.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    impl AlertSink for RecordingSink {
        fn emit(&self, alert: &Alert) {
            self.0.lock().unwrap().push(alert.rule.clone());
        }
    }

    fn active(errors: u64, rows: u64) -> ImportMetrics {
        ImportMetrics {
            active_jobs: 1,
            rows_processed: rows,
            errors_total: errors,
            ..Default::default()
        }
    }

    #[test]
    fn test_comparison_operators() {
        assert!(Comparison::GreaterThan.holds(2.0, 1.0));
        assert!(!Comparison::GreaterThan.holds(1.0, 1.0));
        assert!(Comparison::GreaterOrEqual.holds(1.0, 1.0));
        assert!(Comparison::LessThan.holds(0.5, 1.0));
        assert!(Comparison::LessOrEqual.holds(1.0, 1.0));
    }

    #[test]
    fn test_cooldown_suppresses_repeat_firing() {
        let sink = Arc::new(RecordingSink::default());
        let manager = AlertManager::new(vec![AlertRule::new(
            "errors",
            AlertMetric::ErrorRate,
            Comparison::GreaterThan,
            0.1,
        )
        .cooldown(Duration::from_secs(60))])
        .with_sink(sink.clone());

        let t0 = Instant::now();
        assert_eq!(manager.evaluate_at(&active(5, 10), t0).len(), 1);
        assert!(manager.evaluate_at(&active(5, 10), t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(
            manager.evaluate_at(&active(5, 10), t0 + Duration::from_secs(61)).len(),
            1
        );
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_sustained_condition_required() {
        let manager = AlertManager::new(vec![AlertRule::new(
            "slow",
            AlertMetric::ProcessingRate,
            Comparison::LessThan,
            1.0,
        )
        .sustained_for(Duration::from_secs(120))
        .while_active()]);

        let t0 = Instant::now();
        let slow = active(0, 0);
        assert!(manager.evaluate_at(&slow, t0).is_empty());
        assert!(manager.evaluate_at(&slow, t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(manager.evaluate_at(&slow, t0 + Duration::from_secs(120)).len(), 1);

        // condition broken resets the clock
        let idle = ImportMetrics::default();
        assert!(manager.evaluate_at(&idle, t0 + Duration::from_secs(130)).is_empty());
        assert!(manager.evaluate_at(&slow, t0 + Duration::from_secs(140)).is_empty());
    }

    #[test]
    fn test_counter_rules_fire_on_increase_only() {
        let manager = AlertManager::new(vec![AlertRule::new(
            "dlq",
            AlertMetric::DeadLetteredRows,
            Comparison::GreaterThan,
            0.0,
        )
        .cooldown(Duration::ZERO)]);

        let t0 = Instant::now();
        let mut m = ImportMetrics {
            rows_dead_lettered: 2,
            ..Default::default()
        };
        assert_eq!(manager.evaluate_at(&m, t0).len(), 1);
        assert!(manager.evaluate_at(&m, t0 + Duration::from_secs(1)).is_empty());
        m.rows_dead_lettered = 3;
        let fired = manager.evaluate_at(&m, t0 + Duration::from_secs(2));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, 1.0);
    }

    #[test]
    fn test_default_rules_ignore_idle_process() {
        let manager = AlertManager::with_default_rules();
        assert_eq!(manager.rules().len(), 4);
        assert!(manager.evaluate(&ImportMetrics::default()).is_empty());
    }
}
