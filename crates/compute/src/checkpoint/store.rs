use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use batchwise_core::atomic::{retry_io, write_atomic};
use batchwise_core::{TaskId, TaskResult};
use serde_json::Value;
use tracing::debug;

use crate::observer::{BatchEvent, SharedObserver, TracingObserver};

use super::record::{Checkpoint, CheckpointRecord};
use super::CheckpointError;

pub const METADATA_FILE: &str = "checkpoint.json";
pub const RESULTS_FILE: &str = "results.msgpack";

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Durable batch progress in a directory of two files.
///
/// `results.msgpack` is written before `checkpoint.json`; the metadata file
/// is the commit point. Each file is replaced atomically, so a crash at any
/// moment leaves a loadable checkpoint behind.
pub struct CheckpointStore {
    dir: PathBuf,
    observer: SharedObserver,
    attempts: u32,
    retry_delay: Duration,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            observer: TracingObserver::shared(),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Override the write retry budget.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    /// Atomically replace the current checkpoint.
    ///
    /// Failed task ids are taken from `results`. Write failures are retried;
    /// if every attempt fails the previous checkpoint is still intact and
    /// the error is returned.
    pub fn save(
        &self,
        completed: &[TaskId],
        pending: &[TaskId],
        results: &[TaskResult],
        metadata: &BTreeMap<String, Value>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let done: HashSet<&str> = completed.iter().map(String::as_str).collect();
        let mut failed: Vec<TaskId> = Vec::new();
        for r in results.iter().filter(|r| !r.success) {
            if !done.contains(r.task_id.as_str()) && !failed.contains(&r.task_id) {
                failed.push(r.task_id.clone());
            }
        }

        let record = CheckpointRecord::new(completed, pending, failed, metadata.clone());
        let results_bytes = rmp_serde::to_vec_named(results)?;
        let record_bytes = serde_json::to_vec_pretty(&record)?;

        let written = retry_io("checkpoint write", self.attempts, self.retry_delay, || {
            write_atomic(&self.results_path(), &results_bytes)?;
            write_atomic(&self.metadata_path(), &record_bytes)
        });

        match written {
            Ok(()) => {
                self.observer.on_event(&BatchEvent::CheckpointSaved {
                    n_completed: record.n_completed,
                    n_pending: record.n_pending,
                });
                Ok(record)
            }
            Err(e) => {
                self.observer.on_event(&BatchEvent::CheckpointFailed { error: e.to_string() });
                Err(CheckpointError::Io(e))
            }
        }
    }

    /// Read only the metadata record. `None` when no checkpoint exists.
    pub fn load_record(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let bytes = match fs::read(self.metadata_path()) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CheckpointRecord = serde_json::from_slice(&bytes)?;
        Ok(Some(record))
    }

    /// Load the latest checkpoint with its results.
    ///
    /// Results whose id is in neither `completed_ids` nor `failed_ids` are
    /// dropped: they can only come from a save interrupted between its two
    /// writes, and their tasks are still pending.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(record) = self.load_record()? else {
            return Ok(None);
        };

        let bytes = fs::read(self.results_path()).map_err(|e| {
            CheckpointError::Corrupt(format!(
                "{} present but {} unreadable: {}",
                METADATA_FILE, RESULTS_FILE, e
            ))
        })?;
        let all: Vec<TaskResult> = rmp_serde::from_slice(&bytes)?;

        let known: HashSet<&str> = record
            .completed_ids
            .iter()
            .chain(&record.failed_ids)
            .map(String::as_str)
            .collect();

        // One result per id; a later attempt replaces an earlier one.
        let mut position: HashMap<TaskId, usize> = HashMap::new();
        let mut results: Vec<TaskResult> = Vec::new();
        for r in all.into_iter().filter(|r| known.contains(r.task_id.as_str())) {
            match position.get(&r.task_id) {
                Some(&i) => results[i] = r,
                None => {
                    position.insert(r.task_id.clone(), results.len());
                    results.push(r);
                }
            }
        }

        self.observer.on_event(&BatchEvent::CheckpointLoaded {
            n_completed: record.n_completed,
            n_pending: record.n_pending,
        });
        Ok(Some(Checkpoint { record, results }))
    }

    /// Remove both checkpoint files. Returns whether anything was removed.
    pub fn clear(&self) -> Result<bool, CheckpointError> {
        let mut removed = false;
        // Metadata first: without it the results file is never read.
        for path in [self.metadata_path(), self.results_path()] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            self.observer.on_event(&BatchEvent::CheckpointCleared);
        } else {
            debug!(dir = %self.dir.display(), "No checkpoint to clear");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use batchwise_core::ErrorClass;
    use serde_json::json;

    use super::*;
    use crate::observer::RecordingObserver;

    fn ids(v: &[&str]) -> Vec<TaskId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn ok(id: &str) -> TaskResult {
        TaskResult::success(id, json!({"score": 1.0}), Duration::from_millis(3))
    }

    #[test]
    fn save_load_clear_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save(&ids(&["t1"]), &ids(&["t2"]), &[ok("t1")], &BTreeMap::new()).unwrap();
        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.record.n_completed, 1);
        assert_eq!(cp.record.pending_ids, ids(&["t2"]));
        assert_eq!(cp.results.len(), 1);
        assert_eq!(cp.results[0].payload, Some(json!({"score": 1.0})));

        assert!(store.clear().unwrap());
        assert!(store.load().unwrap().is_none());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn null_success_payload_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let quiet = TaskResult::success("t1", Value::Null, Duration::ZERO);

        store.save(&ids(&["t1"]), &[], &[quiet], &BTreeMap::new()).unwrap();
        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.results.len(), 1);
        assert!(cp.results[0].success);
        assert_eq!(cp.results[0].payload, Some(Value::Null));
        assert!(cp.results[0].error.is_none());
    }

    #[test]
    fn load_without_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.load().unwrap().is_none());
        assert!(store.load_record().unwrap().is_none());
    }

    #[test]
    fn failed_results_are_listed_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let failed = TaskResult::failure("t2", "not found", ErrorClass::Failed, Duration::ZERO);

        let record = store
            .save(&ids(&["t1"]), &ids(&["t2", "t3"]), &[ok("t1"), failed], &BTreeMap::new())
            .unwrap();
        assert_eq!(record.failed_ids, ids(&["t2"]));

        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.results.len(), 2);
        assert!(!cp.results[1].success);
    }

    #[test]
    fn overwrite_keeps_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&ids(&["a"]), &ids(&["b", "c"]), &[ok("a")], &BTreeMap::new()).unwrap();
        store
            .save(&ids(&["a", "b"]), &ids(&["c"]), &[ok("a"), ok("b")], &BTreeMap::new())
            .unwrap();

        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.record.completed_ids, ids(&["a", "b"]));
        assert_eq!(cp.results.len(), 2);
    }

    #[test]
    fn results_ahead_of_metadata_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&ids(&["a"]), &ids(&["b"]), &[ok("a")], &BTreeMap::new()).unwrap();

        // Simulate a crash after the results write of the next save.
        let newer = rmp_serde::to_vec_named(&vec![ok("a"), ok("b")]).unwrap();
        fs::write(store.results_path(), newer).unwrap();

        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.record.completed_ids, ids(&["a"]));
        assert_eq!(cp.results.len(), 1);
        assert_eq!(cp.results[0].task_id, "a");
    }

    #[test]
    fn missing_results_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&ids(&["a"]), &[], &[ok("a")], &BTreeMap::new()).unwrap();
        fs::remove_file(store.results_path()).unwrap();
        assert!(matches!(store.load(), Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn failed_write_leaves_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let obs = RecordingObserver::new();
        let store = CheckpointStore::new(dir.path())
            .with_observer(obs.clone())
            .with_retry(2, Duration::ZERO);
        store.save(&ids(&["a"]), &ids(&["b"]), &[ok("a")], &BTreeMap::new()).unwrap();

        // A directory squatting on the results path makes every rename fail.
        fs::remove_file(store.results_path()).unwrap();
        fs::create_dir(store.results_path()).unwrap();
        fs::write(store.results_path().join("blocker"), b"x").unwrap();

        let err = store.save(&ids(&["a", "b"]), &[], &[ok("a"), ok("b")], &BTreeMap::new());
        assert!(err.is_err());
        assert_eq!(obs.count(|e| matches!(e, BatchEvent::CheckpointFailed { .. })), 1);

        let record = store.load_record().unwrap().unwrap();
        assert_eq!(record.completed_ids, ids(&["a"]));
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut meta = BTreeMap::new();
        meta.insert("input".to_string(), json!("tasks.json"));
        store.save(&[], &ids(&["x"]), &[], &meta).unwrap();
        let record = store.load_record().unwrap().unwrap();
        assert_eq!(record.metadata["input"], "tasks.json");
    }
}
