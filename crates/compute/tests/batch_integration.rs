//! End-to-end behaviour of the batch engine through its public API.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchwise_compute::{
    executor_fn, BatchScheduler, CheckpointStore, RunState, SchedulerConfig, TaskError, TaskExecutor,
};
use batchwise_core::{Task, TaskResult};
use serde_json::json;

fn task_list(ids: &[&str]) -> Vec<Task> {
    ids.iter().map(|id| Task::new(*id)).collect()
}

fn numbered(n: usize) -> Vec<Task> {
    (1..=n).map(|i| Task::new(format!("task-{:02}", i))).collect()
}

/// Executor that remembers which ids it was asked to run.
fn recording_executor() -> (Arc<dyn TaskExecutor>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let exec = executor_fn(move |task| {
        s.lock().unwrap().push(task.id.clone());
        Ok(json!({ "id": task.id }))
    });
    (exec, seen)
}

fn config(jobs: i64) -> SchedulerConfig {
    SchedulerConfig { jobs, ..SchedulerConfig::default() }
}

#[test]
fn resume_dispatches_only_unfinished_tasks() {
    let dir = tempfile::tempdir().unwrap();
    CheckpointStore::new(dir.path())
        .save(
            &["A".to_string(), "B".to_string()],
            &["C".to_string()],
            &[
                TaskResult::success("A", json!(1), Duration::ZERO),
                TaskResult::success("B", json!(2), Duration::ZERO),
            ],
            &BTreeMap::new(),
        )
        .unwrap();

    let (exec, seen) = recording_executor();
    let mut cfg = config(1);
    cfg.resume = true;
    let mut scheduler = BatchScheduler::new(cfg).with_checkpoint_store(CheckpointStore::new(dir.path()));
    let outcome = scheduler.run(task_list(&["A", "B", "C", "D"]), exec).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["C".to_string(), "D".to_string()]);
    assert_eq!(outcome.results.len(), 4);
    assert_eq!(outcome.resumed, 2);
    assert!(outcome.is_complete());
    // Completed runs leave no checkpoint behind.
    assert!(CheckpointStore::new(dir.path()).load().unwrap().is_none());
}

#[test]
fn one_failure_does_not_stop_the_batch() {
    let exec = executor_fn(|task| {
        if task.id == "task-03" {
            Err(TaskError::failed("task 3 always fails"))
        } else {
            Ok(json!(task.id))
        }
    });

    let mut scheduler = BatchScheduler::new(config(1));
    let outcome = scheduler.run(numbered(5), exec).unwrap();

    assert_eq!(outcome.results.len(), 5);
    let failed: Vec<&str> = outcome
        .results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.task_id.as_str())
        .collect();
    assert_eq!(failed, vec!["task-03"]);
    assert!(outcome.results[3].success && outcome.results[4].success);
}

#[test]
fn sequential_results_follow_submission_order() {
    let (exec, _) = recording_executor();
    let tasks = numbered(10);
    let expected: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

    let mut scheduler = BatchScheduler::new(config(1));
    let outcome = scheduler.run(tasks, exec).unwrap();

    let got: Vec<String> = outcome.results.iter().map(|r| r.task_id.clone()).collect();
    assert_eq!(got, expected);
}

#[test]
fn pooled_results_cover_every_task_exactly_once() {
    let exec = executor_fn(|task| {
        // Uneven durations so completion order differs from submission order.
        let n: u64 = task.id.trim_start_matches("task-").parse().unwrap_or(0);
        std::thread::sleep(Duration::from_millis((20 - n % 20) * 2));
        Ok(json!(n))
    });

    let mut scheduler = BatchScheduler::new(config(4));
    let outcome = scheduler.run(numbered(20), exec).unwrap();

    assert_eq!(outcome.results.len(), 20);
    let ids: HashSet<&str> = outcome.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(outcome.state, RunState::Completed);
}

#[test]
fn all_units_concurrency_runs_everything() {
    let (exec, seen) = recording_executor();
    let mut scheduler = BatchScheduler::new(config(-1));
    let outcome = scheduler.run(numbered(12), exec).unwrap();
    assert_eq!(outcome.summary.successful, 12);
    assert_eq!(seen.lock().unwrap().len(), 12);
}

#[test]
fn checkpoint_save_load_clear() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());

    store
        .save(
            &["t1".to_string()],
            &["t2".to_string()],
            &[TaskResult::success("t1", json!("ok"), Duration::ZERO)],
            &BTreeMap::new(),
        )
        .unwrap();
    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded.record.n_completed, 1);

    store.clear().unwrap();
    assert!(store.load().unwrap().is_none());
}

#[test]
fn end_to_end_summary_for_mixed_batch() {
    let exec = executor_fn(|task| match task.id.as_str() {
        "1ABC" => Ok(json!({ "score": -7.5 })),
        _ => Err(TaskError::failed("not found")),
    });

    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = BatchScheduler::new(config(1)).with_checkpoint_store(CheckpointStore::new(dir.path()));
    let outcome = scheduler.run(task_list(&["1ABC", "2XYZ"]), exec).unwrap();

    let s = &outcome.summary;
    assert_eq!(s.total_tasks, 2);
    assert_eq!(s.successful, 1);
    assert_eq!(s.failed, 1);
    assert_eq!(s.success_rate, 0.5);
    assert_eq!(s.failed_tasks.len(), 1);
    assert_eq!(s.failed_tasks[0].task_id, "2XYZ");
    assert_eq!(s.failed_tasks[0].error, "not found");

    let report_path = dir.path().join("batch_results.json");
    outcome.report().write(&report_path).unwrap();
    let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
    assert_eq!(report["summary"]["success_rate"], 0.5);
    assert_eq!(report["results"][0]["payload"]["score"], -7.5);
}

#[test]
fn metadata_passes_through_untouched() {
    let exec = executor_fn(|task| Ok(task.metadata.get("tag").cloned().unwrap_or(json!(null))));
    let task = Task::new("m1").with_metadata("tag", json!({"nested": [1, 2]}));

    let mut scheduler = BatchScheduler::new(config(2));
    let outcome = scheduler.run(vec![task], exec).unwrap();
    assert_eq!(outcome.results[0].payload, Some(json!({"nested": [1, 2]})));
}
