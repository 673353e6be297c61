//! Memory probes feeding the resource monitor

use catalog_common::types::bytes_to_mb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};

/// Source of process memory readings in MB
pub trait MemoryProbe: Send + Sync {
    /// Resident memory currently used by the process
    fn used_mb(&self) -> f64;
}

/// Reads resident memory of the current process via `sysinfo`
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "Cannot resolve current pid, memory readings disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        if !system.refresh_process(pid) {
            return 0.0;
        }
        system
            .process(pid)
            .map(|process| bytes_to_mb(process.memory()))
            .unwrap_or(0.0)
    }
}

/// Probe reporting a value set by the caller
///
/// Used for deterministic simulations and tests; cloning shares the reading.
#[derive(Clone, Default)]
pub struct FixedMemoryProbe {
    // f64 bits
    used: Arc<AtomicU64>,
}

impl FixedMemoryProbe {
    pub fn new(used_mb: f64) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(used_mb.to_bits())),
        }
    }

    pub fn set(&self, used_mb: f64) {
        self.used.store(used_mb.to_bits(), Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_mb(&self) -> f64 {
        f64::from_bits(self.used.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe_shares_reading_between_clones() {
        let probe = FixedMemoryProbe::new(12.5);
        let clone = probe.clone();
        assert_eq!(clone.used_mb(), 12.5);
        probe.set(80.0);
        assert_eq!(clone.used_mb(), 80.0);
    }

    #[test]
    fn test_process_probe_reports_nonnegative_usage() {
        let probe = ProcessMemoryProbe::new();
        assert!(probe.used_mb() >= 0.0);
    }
}
