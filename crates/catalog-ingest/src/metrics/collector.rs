//! Import metrics aggregation
//!
//! Producers hold a cloneable [`MetricsHandle`] and push events onto an
//! unbounded channel; one aggregator task folds them into [`ImportMetrics`].
//! Recording never blocks and never touches pipeline state.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::recovery::ErrorType;
use crate::resource::ResourceEvent;

/// Smoothing factor of the processing-rate moving average
pub const RATE_SMOOTHING: f64 = 0.3;

/// Job durations kept for percentiles
pub const DURATION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Started,
    Completed { duration_ms: u64 },
    Failed { duration_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEventKind {
    Succeeded,
    Failed,
    DeadLettered,
}

#[derive(Debug)]
pub enum MetricEvent {
    Job(JobEvent),
    RowProcessing { kind: RowEventKind, duration_ms: u64 },
    Memory(ResourceEvent),
    /// Resident memory of one sample, whether or not it crossed a threshold
    MemorySample { used_mb: f64 },
    Error(ErrorType),
    /// Acknowledged once every earlier event has been applied
    Flush(oneshot::Sender<()>),
}

/// Process-wide counters and derived gauges
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportMetrics {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub active_jobs: u64,
    pub rows_processed: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub rows_dead_lettered: u64,
    pub errors_total: u64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub memory_warning_events: u64,
    pub memory_critical_events: u64,
    pub memory_recovered_events: u64,
    pub peak_memory_mb: f64,
    /// Rows per second, exponentially smoothed across collection ticks
    pub processing_rate: f64,
    pub p95_job_duration_ms: Option<u64>,
    pub p99_job_duration_ms: Option<u64>,
}

impl ImportMetrics {
    /// Errors per processed row
    pub fn error_rate(&self) -> f64 {
        if self.rows_processed == 0 {
            0.0
        } else {
            self.errors_total as f64 / self.rows_processed as f64
        }
    }
}

/// Nearest-rank percentile of an unsorted sample
pub fn percentile(values: &[u64], pct: f64) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

#[derive(Debug)]
struct MetricsState {
    metrics: ImportMetrics,
    durations: VecDeque<u64>,
    rate_mark: Option<(Instant, u64)>,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            metrics: ImportMetrics::default(),
            durations: VecDeque::with_capacity(DURATION_WINDOW),
            rate_mark: None,
        }
    }

    fn apply(&mut self, event: MetricEvent) {
        let m = &mut self.metrics;
        match event {
            MetricEvent::Job(JobEvent::Started) => {
                m.jobs_started += 1;
                m.active_jobs += 1;
            }
            MetricEvent::Job(JobEvent::Completed { duration_ms }) => {
                m.jobs_completed += 1;
                m.active_jobs = m.active_jobs.saturating_sub(1);
                self.push_duration(duration_ms);
            }
            MetricEvent::Job(JobEvent::Failed { duration_ms }) => {
                m.jobs_failed += 1;
                m.active_jobs = m.active_jobs.saturating_sub(1);
                self.push_duration(duration_ms);
            }
            MetricEvent::RowProcessing { kind, .. } => {
                m.rows_processed += 1;
                match kind {
                    RowEventKind::Succeeded => m.rows_succeeded += 1,
                    RowEventKind::Failed => m.rows_failed += 1,
                    RowEventKind::DeadLettered => m.rows_dead_lettered += 1,
                }
            }
            MetricEvent::Memory(event) => {
                m.peak_memory_mb = m.peak_memory_mb.max(event.snapshot().used_mb);
                match event {
                    ResourceEvent::Warning(_) => m.memory_warning_events += 1,
                    ResourceEvent::Critical(_) => m.memory_critical_events += 1,
                    ResourceEvent::Recovered(_) => m.memory_recovered_events += 1,
                }
            }
            MetricEvent::MemorySample { used_mb } => {
                m.peak_memory_mb = m.peak_memory_mb.max(used_mb);
            }
            MetricEvent::Error(error_type) => {
                m.errors_total += 1;
                *m.errors_by_type
                    .entry(error_type.as_str().to_string())
                    .or_insert(0) += 1;
            }
            MetricEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn push_duration(&mut self, duration_ms: u64) {
        if self.durations.len() == DURATION_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration_ms);
        let window: Vec<u64> = self.durations.iter().copied().collect();
        self.metrics.p95_job_duration_ms = percentile(&window, 95.0);
        self.metrics.p99_job_duration_ms = percentile(&window, 99.0);
    }

    /// Fold the rows seen since the previous tick into the moving average
    fn update_rate(&mut self, now: Instant) {
        let rows = self.metrics.rows_processed;
        if let Some((since, rows_then)) = self.rate_mark {
            let elapsed = now.saturating_duration_since(since).as_secs_f64();
            if elapsed > 0.0 {
                let instant_rate = rows.saturating_sub(rows_then) as f64 / elapsed;
                self.metrics.processing_rate = RATE_SMOOTHING * instant_rate
                    + (1.0 - RATE_SMOOTHING) * self.metrics.processing_rate;
            }
        }
        self.rate_mark = Some((now, rows));
    }
}

/// Cloneable producer side of the metrics channel
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl MetricsHandle {
    fn send(&self, event: MetricEvent) {
        if self.tx.send(event).is_err() {
            trace!("Metrics aggregator stopped, event dropped");
        }
    }

    pub fn record_job_event(&self, event: JobEvent) {
        self.send(MetricEvent::Job(event));
    }

    pub fn record_row_processing(&self, kind: RowEventKind, duration_ms: u64) {
        self.send(MetricEvent::RowProcessing { kind, duration_ms });
    }

    pub fn record_memory_event(&self, event: &ResourceEvent) {
        self.send(MetricEvent::Memory(*event));
    }

    pub fn record_memory_sample(&self, used_mb: f64) {
        self.send(MetricEvent::MemorySample { used_mb });
    }

    pub fn record_error(&self, error_type: ErrorType) {
        self.send(MetricEvent::Error(error_type));
    }
}

/// Owns the aggregator task and the aggregated state
///
/// Constructed once by the caller and shared as `Arc<MetricsCollector>`.
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
    handle: MetricsHandle,
    aggregator: JoinHandle<()>,
}

impl MetricsCollector {
    /// Start the aggregator; must be called inside a Tokio runtime
    pub fn start() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MetricsState::new()));
        let aggregator_state = Arc::clone(&state);
        let aggregator = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                aggregator_state
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .apply(event);
            }
            trace!("Metrics aggregator finished");
        });
        Arc::new(Self {
            state,
            handle: MetricsHandle { tx },
            aggregator,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn handle(&self) -> MetricsHandle {
        self.handle.clone()
    }

    pub fn snapshot(&self) -> ImportMetrics {
        self.lock().metrics.clone()
    }

    /// Wait until every event sent before this call has been applied
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.handle.send(MetricEvent::Flush(ack));
        let _ = done.await;
    }

    /// Collection tick: refresh the smoothed rate and return a snapshot
    pub fn tick(&self) -> ImportMetrics {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> ImportMetrics {
        let mut state = self.lock();
        state.update_rate(now);
        state.metrics.clone()
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.aggregator.abort();
    }
}
