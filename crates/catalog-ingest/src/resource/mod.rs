//! Memory sampling, admission gating and concurrency control

pub mod monitor;
pub mod probe;
pub mod slots;

pub use monitor::{MemorySnapshot, MonitorConfig, ReclaimHook, ResourceEvent, ResourceMonitor};
pub use probe::{FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use slots::{SlotCounters, SlotPermit, SlotPool};
