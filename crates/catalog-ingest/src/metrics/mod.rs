//! Import metrics and alerting
//!
//! [`MetricsCollector`] aggregates events pushed through [`MetricsHandle`]s.
//! [`spawn_reporter`] ticks the collector on an interval and runs the
//! [`AlertManager`] over each snapshot.

mod alerts;
mod collector;

pub use alerts::{
    default_rules, Alert, AlertManager, AlertMetric, AlertRule, AlertSeverity, AlertSink, Comparison,
    TracingAlertSink,
};
pub use collector::{
    percentile, ImportMetrics, JobEvent, MetricEvent, MetricsCollector, MetricsHandle, RowEventKind,
    DURATION_WINDOW, RATE_SMOOTHING,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic collection and alert evaluation until `cancel` fires
pub fn spawn_reporter(
    collector: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            collector.flush().await;
            let snapshot = collector.tick();
            let fired = alerts.evaluate(&snapshot);
            debug!(
                rows_processed = snapshot.rows_processed,
                processing_rate = snapshot.processing_rate,
                active_jobs = snapshot.active_jobs,
                alerts = fired.len(),
                "Metrics collected"
            );
        }
        info!("Metrics reporter stopped");
    })
}
