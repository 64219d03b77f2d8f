use std::fmt;
use std::path::Path;

use batchwise_core::atomic::write_atomic;
use batchwise_core::{ErrorClass, TaskId, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One failed task, listed for triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

/// Aggregate view of a batch. Times are sums of per-task durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_time_seconds: f64,
    pub average_time_seconds: f64,
    /// Elapsed wall-clock time of the run that produced this summary.
    #[serde(default)]
    pub wall_time_seconds: f64,
    pub failed_tasks: Vec<FailedTask>,
}

impl BatchSummary {
    pub fn from_results(results: &[TaskResult], wall_time_seconds: f64) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let total_time: f64 = results.iter().map(|r| r.duration_secs).sum();
        let failed_tasks: Vec<FailedTask> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| FailedTask {
                task_id: r.task_id.clone(),
                error: r.error_message().to_string(),
                error_class: r.error_class,
            })
            .collect();

        Self {
            total_tasks: total,
            successful,
            failed: failed_tasks.len(),
            success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
            total_time_seconds: total_time,
            average_time_seconds: if total == 0 { 0.0 } else { total_time / total as f64 },
            wall_time_seconds,
            failed_tasks,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch processing summary")?;
        writeln!(f, "  Total tasks:   {}", self.total_tasks)?;
        writeln!(f, "  Successful:    {}", self.successful)?;
        writeln!(f, "  Failed:        {}", self.failed)?;
        writeln!(f, "  Success rate:  {:.1}%", self.success_rate * 100.0)?;
        writeln!(f, "  Task time:     {:.2}s total, {:.2}s average", self.total_time_seconds, self.average_time_seconds)?;
        write!(f, "  Wall time:     {:.2}s", self.wall_time_seconds)?;
        if !self.failed_tasks.is_empty() {
            writeln!(f)?;
            write!(f, "  Failed tasks:")?;
            for t in &self.failed_tasks {
                write!(f, "\n    - {}: {}", t.task_id, t.error)?;
            }
        }
        Ok(())
    }
}

/// Results artifact written after every run (`batch_results.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub timestamp: DateTime<Utc>,
    pub summary: BatchSummary,
    pub results: Vec<TaskResult>,
}

impl BatchReport {
    pub fn new(summary: BatchSummary, results: Vec<TaskResult>) -> Self {
        Self {
            timestamp: Utc::now(),
            summary,
            results,
        }
    }

    /// Write as pretty JSON, replacing any previous report atomically.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomic(path, &json)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn summary_counts_and_rates() {
        let results = vec![
            TaskResult::success("1ABC", json!({"score": -7.5}), Duration::from_secs(2)),
            TaskResult::failure("2XYZ", "not found", ErrorClass::Failed, Duration::from_secs(1)),
        ];
        let s = BatchSummary::from_results(&results, 2.5);
        assert_eq!(s.total_tasks, 2);
        assert_eq!(s.successful, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.success_rate, 0.5);
        assert!((s.total_time_seconds - 3.0).abs() < 1e-9);
        assert!((s.average_time_seconds - 1.5).abs() < 1e-9);
        assert_eq!(s.failed_tasks[0].task_id, "2XYZ");
        assert_eq!(s.failed_tasks[0].error, "not found");
        assert!(!s.all_succeeded());
    }

    #[test]
    fn empty_summary_has_zero_rate() {
        let s = BatchSummary::from_results(&[], 0.0);
        assert_eq!(s.total_tasks, 0);
        assert_eq!(s.success_rate, 0.0);
        assert_eq!(s.average_time_seconds, 0.0);
        assert!(s.all_succeeded());
    }

    #[test]
    fn display_lists_failures() {
        let results = vec![TaskResult::failure("t9", "boom", ErrorClass::Panicked, Duration::ZERO)];
        let text = BatchSummary::from_results(&results, 0.1).to_string();
        assert!(text.contains("Failed:        1"));
        assert!(text.contains("t9: boom"));
    }

    #[test]
    fn report_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_results.json");
        let results = vec![TaskResult::failure("t1", "bad input", ErrorClass::InvalidParameters, Duration::ZERO)];
        let report = BatchReport::new(BatchSummary::from_results(&results, 0.0), results);
        report.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["failed"], 1);
        assert_eq!(value["results"][0]["error"], "bad input");
        assert_eq!(value["results"][0]["error_class"], "invalid_parameters");
    }
}
