use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use batchwise_core::TaskResult;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::observer::{SharedObserver, TracingObserver};
use crate::resources::MemoryMonitor;
use crate::scheduler::state::{RunState, StopReason};
use crate::scheduler::summary::{BatchReport, BatchSummary};
use crate::scheduler::types::SchedulerConfig;

/// Disk-space pre-flight settings: `base_mb + per_task_mb * tasks` must be
/// free on the disk holding `path`.
#[derive(Debug, Clone)]
pub struct DiskCheck {
    pub path: PathBuf,
    pub base_mb: f64,
    pub per_task_mb: f64,
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub state: RunState,
    /// Set when the run ended `Cancelled`.
    pub stop_reason: Option<StopReason>,
    /// One result per attempted task, including results restored from a
    /// checkpoint. Completion order in pooled mode.
    pub results: Vec<TaskResult>,
    pub summary: BatchSummary,
    /// Tasks skipped because a checkpoint already accounted for them.
    pub resumed: usize,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn report(&self) -> BatchReport {
        BatchReport::new(self.summary.clone(), self.results.clone())
    }
}

/// Runs one batch of tasks to completion or cancellation.
///
/// One scheduler per batch: `run` may be called once.
pub struct BatchScheduler {
    pub(super) config: SchedulerConfig,
    pub(super) checkpoints: Option<CheckpointStore>,
    pub(super) monitor: Option<MemoryMonitor>,
    pub(super) disk_check: Option<DiskCheck>,
    pub(super) observer: SharedObserver,
    /// Shutdown signal, checked between dispatches.
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) state: RunState,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            checkpoints: None,
            monitor: None,
            disk_check: None,
            observer: TracingObserver::shared(),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: RunState::Created,
        }
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_memory_monitor(mut self, monitor: MemoryMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_disk_check(mut self, check: DiskCheck) -> Self {
        self.disk_check = Some(check);
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Stop dispatching new tasks. In-flight tasks still finish.
    pub fn shutdown(&self) {
        info!("Batch shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub(super) fn stop_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(super) fn transition(&mut self, next: RunState) {
        debug_assert!(self.state.can_transition_to(next), "{:?} -> {:?}", self.state, next);
        debug!(from = ?self.state, to = ?next, "Run state change");
        self.state = next;
    }
}
