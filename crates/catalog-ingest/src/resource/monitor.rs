//! Memory-pressure monitor
//!
//! Samples process memory on a fixed interval, classifies the pressure level
//! and turns it into two control signals: an admission flag read by the
//! streaming validator and the `max_concurrent` size of the slot pool.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::probe::MemoryProbe;
use super::slots::SlotPool;
use crate::metrics::MetricsHandle;

/// Factor applied to `max_concurrent` on every warning tick
const SHRINK_FACTOR: f64 = 0.7;

/// Fraction of the warning threshold usage must drop below before resuming
const RESUME_FACTOR: f64 = 0.8;

/// `tokio::time::interval` rejects a zero period
const MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(1);

/// Resource monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_memory_mb: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub backpressure_threshold: f64,
    pub sampling_interval: Duration,
    /// Estimated memory cost of one in-flight operation
    pub per_operation_memory_mb: u64,
    /// Absolute ceiling for `max_concurrent`
    pub max_concurrency_cap: usize,
    /// CPU-derived ceiling for `max_concurrent`
    pub cpu_ceiling: usize,
    /// First sleep of `wait_for_admission`
    pub min_admission_backoff: Duration,
    /// Longest single sleep of `wait_for_admission`
    pub max_admission_wait: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: crate::config::DEFAULT_MAX_MEMORY_MB,
            warning_threshold: crate::config::DEFAULT_WARNING_THRESHOLD,
            critical_threshold: crate::config::DEFAULT_CRITICAL_THRESHOLD,
            backpressure_threshold: crate::config::DEFAULT_BACKPRESSURE_THRESHOLD,
            sampling_interval: Duration::from_secs(1),
            per_operation_memory_mb: 8,
            max_concurrency_cap: 20,
            cpu_ceiling: num_cpus::get() * 2,
            min_admission_backoff: Duration::from_millis(50),
            max_admission_wait: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    /// Usage fraction below which a paused monitor resumes admissions
    pub fn resume_threshold(&self) -> f64 {
        self.warning_threshold * RESUME_FACTOR
    }

    /// Best `max_concurrent` for the given usage
    pub fn optimal_concurrency(&self, used_mb: f64) -> usize {
        let available = (self.max_memory_mb as f64 - used_mb).max(0.0);
        let by_memory = (available / self.per_operation_memory_mb.max(1) as f64).floor() as usize;
        by_memory
            .min(self.cpu_ceiling)
            .min(self.max_concurrency_cap)
            .max(1)
    }
}

/// Memory reading classified against the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub used_mb: f64,
    pub max_mb: f64,
    /// Fraction of `max_mb`
    pub percentage: f64,
    pub is_warning: bool,
    pub is_critical: bool,
    pub should_apply_backpressure: bool,
}

impl MemorySnapshot {
    pub fn classify(used_mb: f64, config: &MonitorConfig) -> Self {
        let max_mb = config.max_memory_mb as f64;
        let percentage = if max_mb > 0.0 { used_mb / max_mb } else { 1.0 };
        Self {
            used_mb,
            max_mb,
            percentage,
            is_warning: percentage >= config.warning_threshold,
            is_critical: percentage >= config.critical_threshold,
            should_apply_backpressure: percentage >= config.backpressure_threshold,
        }
    }
}

/// Pressure transitions emitted by [`ResourceMonitor::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "snapshot", rename_all = "snake_case")]
pub enum ResourceEvent {
    Warning(MemorySnapshot),
    Critical(MemorySnapshot),
    /// Usage fell below the resume threshold after a pause
    Recovered(MemorySnapshot),
}

impl ResourceEvent {
    pub fn snapshot(&self) -> &MemorySnapshot {
        match self {
            ResourceEvent::Warning(s) | ResourceEvent::Critical(s) | ResourceEvent::Recovered(s) => s,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceEvent::Warning(_) => "warning",
            ResourceEvent::Critical(_) => "critical",
            ResourceEvent::Recovered(_) => "recovered",
        }
    }
}

/// Callback asked to release memory under critical pressure
pub type ReclaimHook = Arc<dyn Fn(&MemorySnapshot) + Send + Sync>;

fn log_reclaim(snapshot: &MemorySnapshot) {
    warn!(
        used_mb = snapshot.used_mb,
        max_mb = snapshot.max_mb,
        "Critical memory pressure, requesting reclaim"
    );
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    probe: Arc<dyn MemoryProbe>,
    slots: Arc<SlotPool>,
    paused: AtomicBool,
    last: Mutex<Option<MemorySnapshot>>,
    reclaim: ReclaimHook,
    metrics: Option<MetricsHandle>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn MemoryProbe>, slots: Arc<SlotPool>) -> Self {
        Self {
            config,
            probe,
            slots,
            paused: AtomicBool::new(false),
            last: Mutex::new(None),
            reclaim: Arc::new(log_reclaim),
            metrics: None,
        }
    }

    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim = hook;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn slots(&self) -> &Arc<SlotPool> {
        &self.slots
    }

    /// Read and classify current memory usage
    pub fn sample(&self) -> MemorySnapshot {
        let snapshot = MemorySnapshot::classify(self.probe.used_mb(), &self.config);
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
        snapshot
    }

    /// Most recent snapshot, sampling now if none was taken yet
    pub fn last_snapshot(&self) -> MemorySnapshot {
        let last = *self.last.lock().unwrap_or_else(|p| p.into_inner());
        last.unwrap_or_else(|| self.sample())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether a new batch may be admitted; never blocks
    pub fn gate(&self) -> bool {
        !self.is_paused() && self.slots.has_free_slot()
    }

    /// Sample once and apply the pressure rules
    pub fn tick(&self) -> Option<ResourceEvent> {
        let snapshot = self.sample();
        let pct = snapshot.percentage;
        let mut event = None;

        if snapshot.is_critical {
            self.paused.store(true, Ordering::SeqCst);
            (self.reclaim)(&snapshot);
            error!(
                used_mb = snapshot.used_mb,
                percentage = pct,
                "Memory usage critical, admissions paused"
            );
            event = Some(ResourceEvent::Critical(snapshot));
        } else if snapshot.is_warning {
            let current = self.slots.max_concurrent();
            let shrunk = ((current as f64 * SHRINK_FACTOR).round() as usize).max(1);
            self.slots.set_max_concurrent(shrunk);
            warn!(
                used_mb = snapshot.used_mb,
                percentage = pct,
                from = current,
                to = shrunk,
                "Memory usage high, reducing concurrency"
            );
            event = Some(ResourceEvent::Warning(snapshot));
        } else if pct < self.config.resume_threshold() {
            if self.paused.swap(false, Ordering::SeqCst) {
                info!(used_mb = snapshot.used_mb, percentage = pct, "Memory pressure relieved, admissions resumed");
                event = Some(ResourceEvent::Recovered(snapshot));
            }
            let current = self.slots.max_concurrent();
            let optimum = self.config.optimal_concurrency(snapshot.used_mb);
            if current < optimum {
                self.slots.set_max_concurrent(current + 1);
                debug!(from = current, to = current + 1, optimum, "Growing concurrency");
            }
        }

        if snapshot.should_apply_backpressure && !self.paused.swap(true, Ordering::SeqCst) {
            info!(percentage = pct, "Applying backpressure");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_memory_sample(snapshot.used_mb);
            if let Some(event) = &event {
                metrics.record_memory_event(event);
            }
        }
        event
    }

    /// Poll [`Self::gate`] with exponential backoff until admission is allowed
    ///
    /// Returns `false` if cancelled first.
    pub async fn wait_for_admission(&self, cancel: &CancellationToken) -> bool {
        let mut delay = self.config.min_admission_backoff;
        let mut waited = false;
        loop {
            if self.gate() {
                if waited {
                    debug!("Admission granted after backpressure wait");
                }
                return true;
            }
            waited = true;
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_admission_wait);
        }
    }

    /// Run [`Self::tick`] on the sampling interval until cancelled
    pub fn spawn_sampler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.sampling_interval.max(MIN_SAMPLING_INTERVAL));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Resource sampler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.tick();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::FixedMemoryProbe;

    fn monitor_with(max_memory_mb: u64, used_mb: f64) -> (ResourceMonitor, FixedMemoryProbe) {
        let probe = FixedMemoryProbe::new(used_mb);
        let config = MonitorConfig {
            max_memory_mb,
            cpu_ceiling: 8,
            ..MonitorConfig::default()
        };
        let monitor = ResourceMonitor::new(config, Arc::new(probe.clone()), SlotPool::new(10));
        (monitor, probe)
    }

    #[test]
    fn test_snapshot_classification_at_warning_level() {
        let (monitor, probe) = monitor_with(100, 72.0);
        let snap = monitor.sample();
        assert!(snap.is_warning);
        assert!(!snap.is_critical);
        assert!(!snap.should_apply_backpressure);

        probe.set(90.0);
        let snap = monitor.sample();
        assert!(snap.is_critical);
        assert!(snap.should_apply_backpressure);
    }

    #[test]
    fn test_warning_tick_shrinks_concurrency() {
        let (monitor, _) = monitor_with(100, 72.0);
        let event = monitor.tick();
        assert!(matches!(event, Some(ResourceEvent::Warning(_))));
        assert_eq!(monitor.slots().max_concurrent(), 7);
        assert!(monitor.gate());

        for _ in 0..10 {
            monitor.tick();
        }
        assert_eq!(monitor.slots().max_concurrent(), 1);
    }

    #[test]
    fn test_critical_tick_pauses_and_requests_reclaim() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reclaimed);
        let (monitor, _) = monitor_with(100, 90.0);
        let monitor = monitor.with_reclaim_hook(Arc::new(move |_| flag.store(true, Ordering::SeqCst)));

        let event = monitor.tick();
        assert!(matches!(event, Some(ResourceEvent::Critical(_))));
        assert!(monitor.is_paused());
        assert!(!monitor.gate());
        assert!(reclaimed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_backpressure_holds_until_below_resume_threshold() {
        let (monitor, probe) = monitor_with(100, 81.0);
        monitor.tick();
        assert!(!monitor.gate());

        // still above 0.7 * 0.8
        for used in [75.0, 65.0, 57.0] {
            probe.set(used);
            monitor.tick();
            assert!(!monitor.gate(), "gate opened at {} MB", used);
        }

        probe.set(55.0);
        let event = monitor.tick();
        assert!(matches!(event, Some(ResourceEvent::Recovered(_))));
        assert!(monitor.gate());
    }

    #[test]
    fn test_growth_is_bounded_by_optimum() {
        let (monitor, _) = monitor_with(100, 10.0);
        monitor.slots().set_max_concurrent(1);
        // (100 - 10) / 8 = 11, cpu ceiling 8, cap 20
        for _ in 0..20 {
            monitor.tick();
        }
        assert_eq!(monitor.slots().max_concurrent(), 8);
    }

    #[test]
    fn test_optimal_concurrency_never_below_one() {
        let config = MonitorConfig {
            max_memory_mb: 100,
            ..MonitorConfig::default()
        };
        assert_eq!(config.optimal_concurrency(150.0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_admission_returns_false_on_cancel() {
        let (monitor, _) = monitor_with(100, 95.0);
        monitor.tick();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            child.cancel();
        });
        assert!(!monitor.wait_for_admission(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_admission_resumes_after_pressure_drops() {
        let (monitor, probe) = monitor_with(100, 95.0);
        let monitor = Arc::new(monitor);
        monitor.tick();
        let cancel = CancellationToken::new();
        let sampler = monitor.spawn_sampler(cancel.clone());

        let relief = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            probe.set(20.0);
        });

        assert!(monitor.wait_for_admission(&cancel).await);
        assert!(!monitor.is_paused());
        relief.await.unwrap();
        cancel.cancel();
        sampler.await.unwrap();
    }

    #[tokio::test]
    async fn test_quiet_ticks_still_report_peak_memory() {
        let collector = crate::metrics::MetricsCollector::start();
        let probe = FixedMemoryProbe::new(40.0);
        let config = MonitorConfig {
            max_memory_mb: 100,
            ..MonitorConfig::default()
        };
        let monitor = ResourceMonitor::new(config, Arc::new(probe.clone()), SlotPool::new(4))
            .with_metrics(collector.handle());

        assert!(monitor.tick().is_none());
        probe.set(35.0);
        assert!(monitor.tick().is_none());
        collector.flush().await;

        let metrics = collector.snapshot();
        assert_eq!(metrics.peak_memory_mb, 40.0);
        assert_eq!(metrics.memory_warning_events, 0);
    }
}
