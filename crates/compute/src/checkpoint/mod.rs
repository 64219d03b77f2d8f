//! Checkpoint persistence for resumable batches.

pub mod record;
pub mod store;

pub use record::{Checkpoint, CheckpointRecord};
pub use store::{CheckpointStore, METADATA_FILE, RESULTS_FILE};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("results encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("results decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}
