pub mod checkpoint;
pub mod error;
pub mod observer;
pub mod resources;
pub mod scheduler;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointRecord, CheckpointStore};
pub use error::BatchError;
pub use observer::{BatchEvent, BatchObserver, RecordingObserver, SharedObserver, TracingObserver};
pub use resources::{MemoryMonitor, MemorySnapshot, PressureLevel};
pub use scheduler::{
    executor_fn, BatchOutcome, BatchReport, BatchScheduler, BatchSummary, Concurrency, DiskCheck,
    FailedTask, RunState, SchedulerConfig, StopReason, TaskError, TaskExecutor,
};
