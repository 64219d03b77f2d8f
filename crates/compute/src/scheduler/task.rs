use std::sync::Arc;

use batchwise_core::{ErrorClass, Task};
use serde_json::Value;

/// Error returned by a [`TaskExecutor`]. Always ends up as a failed result,
/// never as a batch error.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::Failed(_) => ErrorClass::Failed,
            TaskError::InvalidParameters(_) => ErrorClass::InvalidParameters,
            TaskError::Other(_) => ErrorClass::Internal,
        }
    }
}

/// The caller's unit of work. Opaque to the engine.
///
/// Called from worker threads in pooled mode, hence `Send + Sync`.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &Task) -> Result<Value, TaskError>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&Task) -> Result<Value, TaskError> + Send + Sync,
{
    fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        self(task)
    }
}

/// Wrap a closure as a shareable executor.
pub fn executor_fn<F>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(&Task) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}
