use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use batchwise_core::input::ensure_unique_ids;
use batchwise_core::{CriticalPolicy, ErrorClass, Task, TaskId, TaskResult};
use crossbeam::channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::error::{BatchError, Result};
use crate::observer::BatchEvent;
use crate::resources::{check_space_available, estimate_required_mb, PressureLevel};
use crate::scheduler::state::{RunState, StopReason};
use crate::scheduler::summary::BatchSummary;
use crate::scheduler::task::TaskExecutor;
use crate::scheduler::types::Concurrency;

use super::core::{BatchOutcome, BatchScheduler};
use super::pool::{execute_guarded, JobClaim, WorkerPool};
use super::progress::Progress;

/// Longest the collector blocks before looking at deadlines again.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Decision taken before each dispatch.
enum Gate {
    Go,
    Pause { used_percent: f64 },
    Stop(StopReason),
    Abort { used_percent: f64 },
}

/// How the dispatch loop ended.
enum RunEnd {
    Drained,
    Stopped(StopReason),
    Aborted { used_percent: f64 },
}

struct InFlight {
    task_id: TaskId,
    started: Instant,
    deadline: Option<Instant>,
    claim: Arc<JobClaim>,
}

impl BatchScheduler {
    /// Run `tasks` to completion or cancellation.
    ///
    /// Every task yields exactly one result. Executor errors and panics are
    /// recorded as failed results; only infrastructure and resource problems
    /// come back as `Err`. Sequential runs keep submission order, pooled
    /// runs return results in completion order.
    pub fn run(&mut self, tasks: Vec<Task>, executor: Arc<dyn TaskExecutor>) -> Result<BatchOutcome> {
        if self.state != RunState::Created {
            return Err(BatchError::AlreadyRun);
        }
        ensure_unique_ids(&tasks)?;
        let concurrency = self.config.concurrency()?;
        let started = Instant::now();

        let mut progress = Progress::new(tasks.iter().map(|t| t.id.clone()).collect());
        let skip = self.restore_progress(&mut progress)?;
        let queue: VecDeque<Task> = tasks.into_iter().filter(|t| !skip.contains(&t.id)).collect();
        let resumed = progress.submitted_len() - queue.len();

        self.preflight(queue.len())?;

        self.transition(RunState::Running);
        let workers = concurrency.workers();
        self.observer.on_event(&BatchEvent::RunStarted {
            total: progress.submitted_len(),
            already_done: resumed,
            workers,
        });

        let end = if concurrency == Concurrency::Sequential && self.config.task_timeout().is_none() {
            self.run_inline(queue, executor.as_ref(), &mut progress)
        } else {
            self.run_pooled(queue, executor, workers, &mut progress)?
        };

        self.finish(end, progress, started, resumed)
    }

    fn restore_progress(&self, progress: &mut Progress) -> Result<HashSet<TaskId>> {
        if !self.config.resume {
            return Ok(HashSet::new());
        }
        let Some(store) = &self.checkpoints else {
            warn!("Resume requested but checkpoints are disabled; starting fresh");
            return Ok(HashSet::new());
        };
        match store.load()? {
            Some(checkpoint) => {
                info!(
                    completed = checkpoint.record.n_completed,
                    failed = checkpoint.record.failed_ids.len(),
                    policy = ?self.config.retry_policy,
                    "Resuming from checkpoint"
                );
                Ok(progress.restore(checkpoint, self.config.retry_policy))
            }
            None => {
                info!("No checkpoint found; starting fresh");
                Ok(HashSet::new())
            }
        }
    }

    /// Fail fast before any task runs: critical memory or too little disk.
    fn preflight(&mut self, n_tasks: usize) -> Result<()> {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.check(true)?;
        }
        if let Some(check) = &self.disk_check {
            let required = estimate_required_mb(n_tasks, check.base_mb, check.per_task_mb);
            check_space_available(&check.path, required)?;
        }
        Ok(())
    }

    fn gate(&mut self) -> Gate {
        if self.stop_requested() {
            return Gate::Stop(StopReason::Cancelled);
        }
        let policy = self.config.critical_policy;
        let Some(monitor) = self.monitor.as_mut() else {
            return Gate::Go;
        };
        match monitor.check(false) {
            Ok((PressureLevel::Critical, snap)) => {
                let used_percent = snap.system_used_percent();
                match policy {
                    CriticalPolicy::Throttle => Gate::Pause { used_percent },
                    CriticalPolicy::Abort => Gate::Abort { used_percent },
                }
            }
            _ => Gate::Go,
        }
    }

    /// Dispatch is paused and nothing is in flight: clean up and wait for
    /// memory to drop below critical.
    fn await_recovery(&mut self, used_percent: f64) -> std::result::Result<(), StopReason> {
        self.observer.on_event(&BatchEvent::DispatchPaused { used_percent });
        let poll = self.config.recovery_poll();
        let max_polls = self.config.max_recovery_polls;
        let shutdown = self.shutdown_signal();
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(());
        };

        monitor.cleanup();
        for attempt in 1..=max_polls {
            if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StopReason::Cancelled);
            }
            thread::sleep(poll);
            if let Ok((level, _)) = monitor.check(false) {
                if level < PressureLevel::Critical {
                    debug!(attempt, "Memory below critical again");
                    self.observer.on_event(&BatchEvent::DispatchResumed);
                    return Ok(());
                }
            }
        }
        warn!(polls = max_polls, "Memory did not recover; stopping dispatch");
        Err(StopReason::MemoryPressure)
    }

    // ── Sequential ────────────────────────────────────────────

    fn run_inline(
        &mut self,
        mut queue: VecDeque<Task>,
        executor: &dyn TaskExecutor,
        progress: &mut Progress,
    ) -> RunEnd {
        while !queue.is_empty() {
            match self.gate() {
                Gate::Go => {}
                Gate::Stop(reason) => return RunEnd::Stopped(reason),
                Gate::Abort { used_percent } => return RunEnd::Aborted { used_percent },
                Gate::Pause { used_percent } => {
                    if let Err(reason) = self.await_recovery(used_percent) {
                        return RunEnd::Stopped(reason);
                    }
                    continue;
                }
            }
            let Some(task) = queue.pop_front() else { break };
            self.observer.on_event(&BatchEvent::TaskStarted { task_id: task.id.clone() });
            let result = execute_guarded(executor, &task);
            self.complete(result, progress);
        }
        RunEnd::Drained
    }

    // ── Pooled ────────────────────────────────────────────────

    fn run_pooled(
        &mut self,
        mut queue: VecDeque<Task>,
        executor: Arc<dyn TaskExecutor>,
        workers: usize,
        progress: &mut Progress,
    ) -> Result<RunEnd> {
        if queue.is_empty() {
            return Ok(RunEnd::Drained);
        }
        let size = workers.min(queue.len()).max(1);
        let mut pool = WorkerPool::start(size, executor, Arc::clone(&self.observer))?;
        let timeout = self.config.task_timeout();

        let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
        let mut next_seq: u64 = 0;
        let mut paused: Option<f64> = None;
        let mut end: Option<RunEnd> = None;

        loop {
            // Fill idle workers.
            while end.is_none() && paused.is_none() && in_flight.len() < size && !queue.is_empty() {
                match self.gate() {
                    Gate::Go => {}
                    Gate::Pause { used_percent } => {
                        paused = Some(used_percent);
                        break;
                    }
                    Gate::Stop(reason) => {
                        end = Some(RunEnd::Stopped(reason));
                        break;
                    }
                    Gate::Abort { used_percent } => {
                        end = Some(RunEnd::Aborted { used_percent });
                        break;
                    }
                }
                let Some(task) = queue.pop_front() else { break };
                let task_id = task.id.clone();
                let claim = pool.submit(next_seq, task)?;
                let now = Instant::now();
                in_flight.insert(
                    next_seq,
                    InFlight {
                        task_id,
                        started: now,
                        deadline: timeout.map(|t| now + t),
                        claim,
                    },
                );
                next_seq += 1;
            }

            if in_flight.is_empty() {
                if let Some(used_percent) = paused.take() {
                    match self.await_recovery(used_percent) {
                        Ok(()) => continue,
                        Err(reason) => end = Some(RunEnd::Stopped(reason)),
                    }
                }
                if end.is_some() || queue.is_empty() {
                    break;
                }
                continue;
            }

            match pool.recv_timeout(next_wait(&in_flight)) {
                Ok(done) => {
                    if in_flight.remove(&done.seq).is_some() {
                        self.complete(done.result, progress);
                    } else {
                        debug!(task_id = %done.result.task_id, "Discarding late result");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.expire_overdue(&mut in_flight, &mut pool, progress)?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BatchError::Pool("completion channel closed".to_string()));
                }
            }
        }

        pool.shutdown();
        Ok(end.unwrap_or(RunEnd::Drained))
    }

    /// Record a timeout failure for every overdue task and reclaim its slot.
    fn expire_overdue(
        &mut self,
        in_flight: &mut HashMap<u64, InFlight>,
        pool: &mut WorkerPool,
        progress: &mut Progress,
    ) -> Result<()> {
        let now = Instant::now();
        let overdue: Vec<u64> = in_flight
            .iter()
            .filter(|(_, f)| f.deadline.is_some_and(|d| d <= now))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in overdue {
            let won = in_flight.get(&seq).map(|f| f.claim.abandon()).unwrap_or(false);
            if !won {
                // Finished at the last moment; the real result is queued.
                continue;
            }
            let Some(task) = in_flight.remove(&seq) else { continue };
            let elapsed = now.duration_since(task.started);
            warn!(task_id = %task.task_id, elapsed_secs = elapsed.as_secs_f64(), "Task timed out");
            let result = TaskResult::failure(
                task.task_id,
                format!("task timed out after {:.1}s", elapsed.as_secs_f64()),
                ErrorClass::TimedOut,
                elapsed,
            );
            self.complete(result, progress);
            pool.replace_worker()?;
        }
        Ok(())
    }

    // ── Completion (single writer) ────────────────────────────

    fn complete(&mut self, result: TaskResult, progress: &mut Progress) {
        self.observer.on_event(&BatchEvent::TaskFinished {
            task_id: result.task_id.clone(),
            success: result.success,
            duration_secs: result.duration_secs,
            error_class: result.error_class,
            error: result.error.clone(),
        });
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.track_operation();
        }
        if progress.record(result, self.config.checkpoint_every()) {
            self.save_checkpoint(progress);
        }
    }

    fn save_checkpoint(&self, progress: &Progress) {
        let Some(store) = &self.checkpoints else { return };
        let saved = store.save(
            progress.completed(),
            &progress.pending(),
            progress.results(),
            &self.config.run_metadata,
        );
        if let Err(e) = saved {
            warn!(error = %e, "Continuing; the previous checkpoint remains valid");
        }
    }

    fn finish(
        &mut self,
        end: RunEnd,
        progress: Progress,
        started: Instant,
        resumed: usize,
    ) -> Result<BatchOutcome> {
        let (state, stop_reason, aborted_at) = match end {
            RunEnd::Drained => (RunState::Completed, None, None),
            RunEnd::Stopped(reason) => (RunState::Cancelled, Some(reason), None),
            RunEnd::Aborted { used_percent } => {
                (RunState::Cancelled, Some(StopReason::MemoryPressure), Some(used_percent))
            }
        };

        match state {
            RunState::Completed => {
                if let Some(store) = &self.checkpoints {
                    if let Err(e) = store.clear() {
                        warn!(error = %e, "Failed to clear checkpoint");
                    }
                }
            }
            _ => self.save_checkpoint(&progress),
        }
        self.transition(state);
        self.report_end(&progress);

        let results = progress.into_results();
        let summary = BatchSummary::from_results(&results, started.elapsed().as_secs_f64());
        let outcome = BatchOutcome {
            state,
            stop_reason,
            results,
            summary,
            resumed,
        };
        match aborted_at {
            Some(used_percent) => Err(BatchError::Aborted {
                used_percent,
                outcome: Box::new(outcome),
            }),
            None => Ok(outcome),
        }
    }

    fn report_end(&mut self, progress: &Progress) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.log_summary();
        }
        let successful = progress.results().iter().filter(|r| r.success).count();
        self.observer.on_event(&BatchEvent::RunFinished {
            state: self.state,
            successful,
            failed: progress.results().len() - successful,
        });
    }
}

fn next_wait(in_flight: &HashMap<u64, InFlight>) -> Duration {
    let now = Instant::now();
    in_flight
        .values()
        .filter_map(|f| f.deadline)
        .map(|d| d.saturating_duration_since(now))
        .min()
        .map_or(IDLE_WAIT, |d| d.min(IDLE_WAIT))
}
