//! Throughput-driven batch sizing
//!
//! Keeps a short history of rows/sec measurements and nudges the batch size
//! toward whichever direction recently paid off. Memory pressure reported by
//! the resource monitor always overrides throughput-driven growth.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::resource::MemorySnapshot;

const HISTORY_LEN: usize = 10;
const SHORT_WINDOW: usize = 3;
const GROW_FACTOR: f64 = 1.2;
const SHRINK_FACTOR: f64 = 0.8;
const BACKPRESSURE_FACTOR: f64 = 0.7;
/// Relative gap between recent and overall throughput that triggers a change
const TREND_MARGIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizerConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: usize,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 250,
            initial_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    rows_per_sec: f64,
    memory_used_mb: f64,
}

#[derive(Debug)]
struct SizerState {
    current: usize,
    history: VecDeque<Sample>,
}

/// Adaptive batch sizer, safe to share between the validator and the pipeline
#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    config: SizerConfig,
    state: Mutex<SizerState>,
}

impl AdaptiveBatchSizer {
    pub fn new(config: SizerConfig) -> Self {
        let min = config.min_size.max(1);
        let max = config.max_size.max(min);
        let config = SizerConfig {
            min_size: min,
            max_size: max,
            initial_size: config.initial_size.clamp(min, max),
        };
        Self {
            state: Mutex::new(SizerState {
                current: config.initial_size,
                history: VecDeque::with_capacity(HISTORY_LEN),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SizerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> SizerConfig {
        self.config
    }

    /// Throughput-driven size, ignoring memory pressure
    pub fn current_size(&self) -> usize {
        self.lock().current
    }

    /// Size to use for the next batch given the latest memory reading
    pub fn effective_size(&self, snapshot: &MemorySnapshot) -> usize {
        let current = self.current_size();
        if snapshot.is_critical {
            return self.config.min_size;
        }
        if snapshot.should_apply_backpressure {
            let reduced = (current as f64 * BACKPRESSURE_FACTOR).round() as usize;
            return current.min(reduced).max(self.config.min_size);
        }
        current
    }

    /// Record how long a batch took and adjust the size
    pub fn record_performance(&self, batch_size: usize, duration_ms: u64, memory_used_mb: f64) {
        let seconds = duration_ms.max(1) as f64 / 1000.0;
        let sample = Sample {
            rows_per_sec: batch_size as f64 / seconds,
            memory_used_mb,
        };

        let mut state = self.lock();
        if state.history.len() == HISTORY_LEN {
            state.history.pop_front();
        }
        state.history.push_back(sample);

        if state.history.len() < SHORT_WINDOW {
            return;
        }

        let overall = mean(state.history.iter().map(|s| s.rows_per_sec));
        let recent = mean(
            state
                .history
                .iter()
                .rev()
                .take(SHORT_WINDOW)
                .map(|s| s.rows_per_sec),
        );

        let previous = state.current;
        let next = if recent > overall * (1.0 + TREND_MARGIN) {
            (previous as f64 * GROW_FACTOR).round() as usize
        } else if recent < overall * (1.0 - TREND_MARGIN) {
            (previous as f64 * SHRINK_FACTOR).round() as usize
        } else {
            previous
        };
        state.current = next.clamp(self.config.min_size, self.config.max_size);

        if state.current != previous {
            debug!(
                from = previous,
                to = state.current,
                recent_rows_per_sec = recent,
                overall_rows_per_sec = overall,
                memory_used_mb = sample.memory_used_mb,
                "Adjusted batch size"
            );
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(percentage: f64) -> MemorySnapshot {
        MemorySnapshot {
            used_mb: percentage * 100.0,
            max_mb: 100.0,
            percentage,
            is_warning: percentage >= 0.7,
            is_critical: percentage >= 0.85,
            should_apply_backpressure: percentage >= 0.8,
        }
    }

    #[test]
    fn test_initial_size_is_clamped() {
        let sizer = AdaptiveBatchSizer::new(SizerConfig {
            min_size: 10,
            max_size: 50,
            initial_size: 400,
        });
        assert_eq!(sizer.current_size(), 50);
    }

    #[test]
    fn test_improving_throughput_grows_size() {
        let sizer = AdaptiveBatchSizer::new(SizerConfig::default());
        for _ in 0..5 {
            sizer.record_performance(100, 1000, 10.0);
        }
        assert_eq!(sizer.current_size(), 100);

        // three much faster batches push the short window above the overall mean
        sizer.record_performance(100, 250, 10.0);
        assert_eq!(sizer.current_size(), 120);
    }

    #[test]
    fn test_degrading_throughput_shrinks_size() {
        let sizer = AdaptiveBatchSizer::new(SizerConfig::default());
        for _ in 0..5 {
            sizer.record_performance(100, 1000, 10.0);
        }
        sizer.record_performance(100, 5000, 10.0);
        assert_eq!(sizer.current_size(), 80);
    }

    #[test]
    fn test_pressure_overrides_adaptive_size() {
        let sizer = AdaptiveBatchSizer::new(SizerConfig::default());
        assert_eq!(sizer.effective_size(&snapshot(0.5)), 100);
        assert_eq!(sizer.effective_size(&snapshot(0.82)), 70);
        assert_eq!(sizer.effective_size(&snapshot(0.9)), 10);
    }

    #[test]
    fn test_backpressure_respects_min_size() {
        let sizer = AdaptiveBatchSizer::new(SizerConfig {
            min_size: 10,
            max_size: 250,
            initial_size: 12,
        });
        assert_eq!(sizer.effective_size(&snapshot(0.82)), 10);
    }

    proptest! {
        #[test]
        fn prop_size_stays_within_bounds(
            samples in proptest::collection::vec((1usize..1000, 0u64..20_000, 0.0f64..512.0), 0..60),
            pressure in 0.0f64..1.2,
        ) {
            let sizer = AdaptiveBatchSizer::new(SizerConfig::default());
            for (size, duration, memory) in samples {
                sizer.record_performance(size, duration, memory);
                let current = sizer.current_size();
                prop_assert!((10..=250).contains(&current));
                let effective = sizer.effective_size(&snapshot(pressure));
                prop_assert!((10..=250).contains(&effective));
            }
        }
    }
}
