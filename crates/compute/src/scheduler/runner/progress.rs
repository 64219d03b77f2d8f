use std::collections::HashSet;

use batchwise_core::{RetryPolicy, TaskId, TaskResult};
use tracing::debug;

use crate::checkpoint::Checkpoint;

/// Collector-owned bookkeeping of one run.
///
/// `completed` holds successful ids only, so `pending` (submitted minus
/// completed) always contains failed tasks and retries them on resume.
pub(super) struct Progress {
    submitted: Vec<TaskId>,
    completed: Vec<TaskId>,
    completed_set: HashSet<TaskId>,
    results: Vec<TaskResult>,
    attempts: usize,
}

impl Progress {
    pub(super) fn new(submitted: Vec<TaskId>) -> Self {
        Self {
            submitted,
            completed: Vec::new(),
            completed_set: HashSet::new(),
            results: Vec::new(),
            attempts: 0,
        }
    }

    /// Seed from a checkpoint and return the ids that must not run again.
    ///
    /// Ids the current batch no longer submits are dropped, so the run still
    /// yields exactly one result per submitted task.
    pub(super) fn restore(&mut self, checkpoint: Checkpoint, policy: RetryPolicy) -> HashSet<TaskId> {
        let submitted: HashSet<&str> = self.submitted.iter().map(String::as_str).collect();
        let mut skip: HashSet<TaskId> = HashSet::new();
        let mut dropped = 0usize;

        for id in checkpoint.record.completed_ids {
            if !submitted.contains(id.as_str()) {
                debug!(task_id = %id, "Checkpointed task no longer submitted, dropping");
                dropped += 1;
                continue;
            }
            if self.completed_set.insert(id.clone()) {
                self.completed.push(id.clone());
            }
            skip.insert(id);
        }

        for result in checkpoint.results {
            if !submitted.contains(result.task_id.as_str()) {
                continue;
            }
            if result.success {
                self.results.push(result);
            } else if policy == RetryPolicy::SkipFailed {
                skip.insert(result.task_id.clone());
                self.results.push(result);
            }
        }
        if dropped > 0 {
            debug!(dropped, "Ignored checkpoint entries outside this batch");
        }
        skip
    }

    /// Record one attempt. Returns true when a checkpoint is due
    /// (every `every` attempts of this run).
    pub(super) fn record(&mut self, result: TaskResult, every: usize) -> bool {
        if result.success && self.completed_set.insert(result.task_id.clone()) {
            self.completed.push(result.task_id.clone());
        }
        self.results.push(result);
        self.attempts += 1;
        self.attempts % every.max(1) == 0
    }

    pub(super) fn completed(&self) -> &[TaskId] {
        &self.completed
    }

    /// `submitted - completed`, in submission order.
    pub(super) fn pending(&self) -> Vec<TaskId> {
        self.submitted
            .iter()
            .filter(|id| !self.completed_set.contains(*id))
            .cloned()
            .collect()
    }

    pub(super) fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub(super) fn submitted_len(&self) -> usize {
        self.submitted.len()
    }

    pub(super) fn into_results(self) -> Vec<TaskResult> {
        self.results
    }
}
