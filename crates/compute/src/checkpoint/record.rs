use std::collections::{BTreeMap, HashSet};

use batchwise_core::{TaskId, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The small, human-readable half of a checkpoint (`checkpoint.json`).
///
/// `completed_ids` holds successfully finished tasks only; failed ids are
/// listed separately so a resume can decide whether to retry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub timestamp: DateTime<Utc>,
    pub completed_ids: Vec<TaskId>,
    pub pending_ids: Vec<TaskId>,
    #[serde(default)]
    pub failed_ids: Vec<TaskId>,
    pub n_completed: usize,
    pub n_pending: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl CheckpointRecord {
    /// Build a record, dropping any pending id that is also completed.
    pub fn new(
        completed_ids: &[TaskId],
        pending_ids: &[TaskId],
        failed_ids: Vec<TaskId>,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let done: HashSet<&str> = completed_ids.iter().map(String::as_str).collect();
        let pending: Vec<TaskId> = pending_ids
            .iter()
            .filter(|id| !done.contains(id.as_str()))
            .cloned()
            .collect();
        Self {
            timestamp: Utc::now(),
            n_completed: completed_ids.len(),
            n_pending: pending.len(),
            completed_ids: completed_ids.to_vec(),
            pending_ids: pending,
            failed_ids,
            metadata,
        }
    }

    /// Pending work for a (possibly changed) batch definition:
    /// `submitted - completed`, in submission order. The stored
    /// `pending_ids` are informational only.
    pub fn pending_for<'a>(&self, submitted: impl IntoIterator<Item = &'a TaskId>) -> Vec<TaskId> {
        let done: HashSet<&str> = self.completed_ids.iter().map(String::as_str).collect();
        submitted
            .into_iter()
            .filter(|id| !done.contains(id.as_str()))
            .cloned()
            .collect()
    }
}

/// A loaded checkpoint: the record plus the accumulated results.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub record: CheckpointRecord,
    pub results: Vec<TaskResult>,
}
