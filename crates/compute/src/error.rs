use batchwise_core::CoreError;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::scheduler::BatchOutcome;

/// Infrastructure and resource errors that end a batch run.
///
/// Task failures never show up here: they are recorded as failed
/// [`TaskResult`](batchwise_core::TaskResult)s.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("memory critical: {used_percent:.1}% of system memory in use")]
    ResourceExhausted { used_percent: f64 },

    /// Memory went critical mid-run under the abort policy. The checkpoint
    /// is already saved; `outcome` holds the results gathered so far.
    #[error("batch aborted: memory critical at {used_percent:.1}%")]
    Aborted {
        used_percent: f64,
        outcome: Box<BatchOutcome>,
    },

    #[error(
        "insufficient disk space on {mount}: need {required_mb:.1} MB, {available_mb:.1} MB available"
    )]
    InsufficientDisk {
        mount: String,
        required_mb: f64,
        available_mb: f64,
    },

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("scheduler already ran; create a new one per batch")]
    AlreadyRun,
}

pub type Result<T, E = BatchError> = std::result::Result<T, E>;
