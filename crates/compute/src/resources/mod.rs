//! Resource gates for batch runs: the memory monitor and the disk-space
//! pre-flight check.

pub mod disk;
pub mod monitor;
pub mod probe;

pub use disk::{DiskSpace, check_space_available, estimate_required_mb};
pub use monitor::{CleanupReport, MemoryMonitor, MemorySummary, PressureLevel, assess_pressure};
pub use probe::{ManualProbe, MemoryProbe, MemorySnapshot, SystemProbe};
