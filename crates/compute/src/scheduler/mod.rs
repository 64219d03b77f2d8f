//! Resumable batch scheduler.
//!
//! The scheduler takes an ordered list of [`Task`](batchwise_core::Task)s and
//! a caller-supplied [`TaskExecutor`], runs them sequentially or on a fixed
//! worker pool, and produces exactly one result per task. Progress is
//! checkpointed by the single completion-collection loop so an interrupted
//! batch can resume without re-running finished work.

pub mod runner;
pub mod state;
pub mod summary;
pub mod task;
pub mod types;

pub use runner::{BatchOutcome, BatchScheduler, DiskCheck};
pub use state::{RunState, StopReason};
pub use summary::{BatchReport, BatchSummary, FailedTask};
pub use task::{executor_fn, TaskError, TaskExecutor};
pub use types::{Concurrency, SchedulerConfig};
