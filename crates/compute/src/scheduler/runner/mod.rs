//! Batch runner -- dispatches tasks, collects results, checkpoints progress.
//!
//! Split into focused submodules:
//! - `core`: BatchScheduler struct, builder methods and accessors
//! - `execution`: the run itself (resume, gating, inline and pooled loops)
//! - `pool`: fixed-size worker threads fed through a channel
//! - `progress`: completed/pending bookkeeping owned by the collector

mod core;
mod execution;
mod pool;
mod progress;

pub use self::core::{BatchOutcome, BatchScheduler, DiskCheck};
