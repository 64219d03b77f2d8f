//! Event seam between the engine and whoever wants to watch it.
//!
//! The scheduler, checkpoint store and memory monitor each receive an
//! `Arc<dyn BatchObserver>` at construction and report through it instead of
//! a process-wide logger.

use std::sync::{Arc, Mutex};

use batchwise_core::{ErrorClass, TaskId};
use tracing::{debug, error, info, warn};

use crate::resources::PressureLevel;
use crate::scheduler::RunState;

/// Something noteworthy that happened during a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    RunStarted {
        total: usize,
        already_done: usize,
        workers: usize,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskFinished {
        task_id: TaskId,
        success: bool,
        duration_secs: f64,
        error_class: Option<ErrorClass>,
        error: Option<String>,
    },
    CheckpointLoaded {
        n_completed: usize,
        n_pending: usize,
    },
    CheckpointSaved {
        n_completed: usize,
        n_pending: usize,
    },
    CheckpointFailed {
        error: String,
    },
    CheckpointCleared,
    MemoryPressure {
        level: PressureLevel,
        used_percent: f64,
    },
    CleanupRan {
        before_mb: f64,
        after_mb: f64,
        freed_mb: f64,
    },
    DispatchPaused {
        used_percent: f64,
    },
    DispatchResumed,
    RunFinished {
        state: RunState,
        successful: usize,
        failed: usize,
    },
}

pub trait BatchObserver: Send + Sync {
    fn on_event(&self, event: &BatchEvent);
}

/// Shared handle passed to engine components.
pub type SharedObserver = Arc<dyn BatchObserver>;

/// Default observer: forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn shared() -> SharedObserver {
        Arc::new(TracingObserver)
    }
}

impl BatchObserver for TracingObserver {
    fn on_event(&self, event: &BatchEvent) {
        match event {
            BatchEvent::RunStarted { total, already_done, workers } => {
                info!(
                    total,
                    already_done,
                    workers,
                    "Processing {} tasks ({} already done)",
                    total - already_done.min(total),
                    already_done
                );
            }
            BatchEvent::TaskStarted { task_id } => debug!(task_id = %task_id, "Task started"),
            BatchEvent::TaskFinished { task_id, success: true, duration_secs, .. } => {
                info!(task_id = %task_id, duration_secs = *duration_secs, "Task succeeded");
            }
            BatchEvent::TaskFinished { task_id, error_class, error, duration_secs, .. } => {
                warn!(
                    task_id = %task_id,
                    class = ?error_class,
                    duration_secs = *duration_secs,
                    "Task failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            BatchEvent::CheckpointLoaded { n_completed, n_pending } => {
                info!(n_completed, n_pending, "Checkpoint loaded");
            }
            BatchEvent::CheckpointSaved { n_completed, n_pending } => {
                info!(n_completed, n_pending, "Checkpoint saved");
            }
            BatchEvent::CheckpointFailed { error: e } => {
                error!(error = %e, "Checkpoint save failed; previous checkpoint kept");
            }
            BatchEvent::CheckpointCleared => info!("Checkpoint cleared"),
            BatchEvent::MemoryPressure { level, used_percent } => match level {
                PressureLevel::Critical => {
                    error!(used_percent = *used_percent, "CRITICAL memory usage")
                }
                _ => warn!(used_percent = *used_percent, "High memory usage"),
            },
            BatchEvent::CleanupRan { before_mb, after_mb, freed_mb } => {
                // Only worth reporting when something was actually reclaimed.
                if *freed_mb > 1.0 {
                    info!(
                        "Memory cleanup: freed {:.1} MB ({:.1} -> {:.1} MB)",
                        freed_mb, before_mb, after_mb
                    );
                }
            }
            BatchEvent::DispatchPaused { used_percent } => {
                warn!(used_percent = *used_percent, "Dispatch paused until memory recovers");
            }
            BatchEvent::DispatchResumed => info!("Memory recovered, dispatch resumed"),
            BatchEvent::RunFinished { state, successful, failed } => {
                info!(state = ?state, successful, failed, "Batch finished");
            }
        }
    }
}

/// Observer that keeps every event in memory. Handy in tests and for
/// embedding callers that want to inspect a run afterwards.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BatchEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&BatchEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| pred(ev)).count())
            .unwrap_or(0)
    }
}

impl BatchObserver for RecordingObserver {
    fn on_event(&self, event: &BatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_keeps_order() {
        let obs = RecordingObserver::new();
        obs.on_event(&BatchEvent::CheckpointCleared);
        obs.on_event(&BatchEvent::DispatchResumed);
        assert_eq!(
            obs.events(),
            vec![BatchEvent::CheckpointCleared, BatchEvent::DispatchResumed]
        );
        assert_eq!(obs.count(|e| matches!(e, BatchEvent::DispatchResumed)), 1);
    }

    #[test]
    fn tracing_observer_accepts_every_event() {
        let obs = TracingObserver;
        obs.on_event(&BatchEvent::TaskFinished {
            task_id: "t1".into(),
            success: false,
            duration_secs: 0.1,
            error_class: Some(ErrorClass::Failed),
            error: Some("not found".into()),
        });
        obs.on_event(&BatchEvent::CleanupRan { before_mb: 10.0, after_mb: 9.5, freed_mb: 0.5 });
    }
}
