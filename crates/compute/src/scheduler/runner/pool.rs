use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use batchwise_core::{ErrorClass, Task, TaskResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{BatchError, Result};
use crate::observer::{BatchEvent, SharedObserver};
use crate::scheduler::task::TaskExecutor;

/// Run the executor for one task, turning errors and panics into a failed
/// result. Never propagates anything to the caller.
pub(super) fn execute_guarded(executor: &dyn TaskExecutor, task: &Task) -> TaskResult {
    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(task)));
    let elapsed = start.elapsed();
    match outcome {
        Ok(Ok(payload)) => TaskResult::success(&task.id, payload, elapsed),
        Ok(Err(e)) => TaskResult::failure(&task.id, e.to_string(), e.class(), elapsed),
        Err(panic) => TaskResult::failure(
            &task.id,
            format!("executor panicked: {}", panic_message(panic.as_ref())),
            ErrorClass::Panicked,
            elapsed,
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Job claims ────────────────────────────────────────────────

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides who owns the outcome of a job: the worker that finished it, or
/// the collector that gave up on it after a timeout. Exactly one side wins.
#[derive(Debug, Default)]
pub(super) struct JobClaim(AtomicU8);

impl JobClaim {
    /// Worker side. False means the collector already recorded a timeout.
    fn finish(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Collector side. False means the worker finished first and its result
    /// is already on the way.
    pub(super) fn abandon(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == ABANDONED
    }
}

pub(super) struct Job {
    seq: u64,
    task: Task,
    claim: Arc<JobClaim>,
}

pub(super) struct Completion {
    pub(super) seq: u64,
    pub(super) result: TaskResult,
}

// ── Pool ──────────────────────────────────────────────────────

/// Fixed set of worker threads pulling jobs from one queue and sending
/// completions back to the single collector.
///
/// A worker stuck on a timed-out job is replaced, so the number of workers
/// available for new jobs stays constant.
pub(super) struct WorkerPool {
    jobs_tx: Option<Sender<Job>>,
    jobs_rx: Receiver<Job>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    executor: Arc<dyn TaskExecutor>,
    observer: SharedObserver,
    handles: Vec<JoinHandle<()>>,
    abandoned: usize,
}

impl WorkerPool {
    pub(super) fn start(
        size: usize,
        executor: Arc<dyn TaskExecutor>,
        observer: SharedObserver,
    ) -> Result<Self> {
        let (jobs_tx, jobs_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::unbounded();
        let mut pool = Self {
            jobs_tx: Some(jobs_tx),
            jobs_rx,
            done_tx,
            done_rx,
            executor,
            observer,
            handles: Vec::with_capacity(size),
            abandoned: 0,
        };
        for _ in 0..size.max(1) {
            pool.spawn_worker()?;
        }
        debug!(workers = size, "Worker pool started");
        Ok(pool)
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let id = self.handles.len();
        let jobs = self.jobs_rx.clone();
        let done = self.done_tx.clone();
        let executor = Arc::clone(&self.executor);
        let observer = Arc::clone(&self.observer);

        let handle = thread::Builder::new()
            .name(format!("batchwise-worker-{}", id))
            .spawn(move || worker_loop(id, jobs, done, executor, observer))
            .map_err(|e| BatchError::Pool(format!("failed to spawn worker: {}", e)))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Queue a task. Returns the claim the collector uses to time it out.
    pub(super) fn submit(&self, seq: u64, task: Task) -> Result<Arc<JobClaim>> {
        let claim = Arc::new(JobClaim::default());
        let job = Job {
            seq,
            task,
            claim: Arc::clone(&claim),
        };
        self.jobs_tx
            .as_ref()
            .ok_or_else(|| BatchError::Pool("pool already shut down".to_string()))?
            .send(job)
            .map_err(|_| BatchError::Pool("job queue closed".to_string()))?;
        Ok(claim)
    }

    /// Give up on a stuck worker and start a fresh one in its place.
    pub(super) fn replace_worker(&mut self) -> Result<()> {
        self.abandoned += 1;
        self.spawn_worker()
    }

    pub(super) fn recv_timeout(&self, wait: Duration) -> std::result::Result<Completion, RecvTimeoutError> {
        self.done_rx.recv_timeout(wait)
    }

    /// Close the queue and join idle workers. Workers still stuck on an
    /// abandoned job are left detached; they exit when that job returns.
    pub(super) fn shutdown(mut self) {
        drop(self.jobs_tx.take());
        if self.abandoned > 0 {
            debug!(stuck = self.abandoned, "Leaving timed-out workers detached");
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked outside task execution");
            }
        }
    }
}

fn worker_loop(
    id: usize,
    jobs: Receiver<Job>,
    done: Sender<Completion>,
    executor: Arc<dyn TaskExecutor>,
    observer: SharedObserver,
) {
    while let Ok(job) = jobs.recv() {
        // A replacement was already started for this job.
        if job.claim.is_abandoned() {
            break;
        }
        observer.on_event(&BatchEvent::TaskStarted { task_id: job.task.id.clone() });
        let result = execute_guarded(executor.as_ref(), &job.task);

        if !job.claim.finish() {
            debug!(worker = id, task_id = %job.task.id, "Discarding result of timed-out task");
            break;
        }
        if done.send(Completion { seq: job.seq, result }).is_err() {
            break;
        }
    }
}
