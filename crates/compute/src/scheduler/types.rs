use std::collections::BTreeMap;
use std::time::Duration;

use batchwise_core::config::{BatchConfig, MemoryConfig};
use batchwise_core::{CoreError, CriticalPolicy, RetryPolicy, ALL_UNITS_JOBS};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How many tasks run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    /// One task at a time on the calling thread; results keep submission order.
    Sequential,
    /// Fixed pool of N workers; results arrive in completion order.
    Fixed(usize),
    /// One worker per available execution unit.
    AllUnits,
}

impl Concurrency {
    /// Parse a `--jobs` style value: `1` sequential, `N > 1` fixed pool,
    /// `-1` all units. Anything else is rejected.
    pub fn from_jobs(jobs: i64) -> Result<Self, CoreError> {
        match jobs {
            1 => Ok(Concurrency::Sequential),
            ALL_UNITS_JOBS => Ok(Concurrency::AllUnits),
            n if n > 1 => Ok(Concurrency::Fixed(n as usize)),
            n => Err(CoreError::InvalidConfig(format!(
                "jobs must be >= 1 or {} (all units), got {}",
                ALL_UNITS_JOBS, n
            ))),
        }
    }

    /// Resolve to a worker count (all units = available parallelism).
    pub fn workers(&self) -> usize {
        match self {
            Concurrency::Sequential => 1,
            Concurrency::Fixed(n) => (*n).max(1),
            Concurrency::AllUnits => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Scheduler configuration, typically built from [`BatchConfig`] and
/// [`MemoryConfig`] via [`SchedulerConfig::from_configs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 1 = sequential, N = pool of N, -1 = all units.
    #[serde(default = "default_jobs")]
    pub jobs: i64,
    /// Save a checkpoint every K completed tasks.
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: usize,
    /// Per-task timeout. `None` = tasks may run forever.
    #[serde(default)]
    pub task_timeout_secs: Option<f64>,
    /// Load the checkpoint and skip already completed tasks.
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub critical_policy: CriticalPolicy,
    /// Delay between memory re-checks while dispatch is paused.
    #[serde(default = "default_recovery_poll_ms")]
    pub recovery_poll_ms: u64,
    /// Re-checks allowed before a paused run is given up.
    #[serde(default = "default_max_recovery_polls")]
    pub max_recovery_polls: u32,
    /// Free-form metadata stored with every checkpoint.
    #[serde(default)]
    pub run_metadata: BTreeMap<String, Value>,
}

fn default_jobs() -> i64 { 1 }
fn default_checkpoint_frequency() -> usize { 10 }
fn default_recovery_poll_ms() -> u64 { 1000 }
fn default_max_recovery_polls() -> u32 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            checkpoint_frequency: default_checkpoint_frequency(),
            task_timeout_secs: None,
            resume: false,
            retry_policy: RetryPolicy::default(),
            critical_policy: CriticalPolicy::default(),
            recovery_poll_ms: default_recovery_poll_ms(),
            max_recovery_polls: default_max_recovery_polls(),
            run_metadata: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Derive the scheduler settings from the layered application config.
    pub fn from_configs(batch: &BatchConfig, memory: &MemoryConfig) -> Self {
        Self {
            jobs: batch.jobs,
            checkpoint_frequency: batch.checkpoint_frequency,
            task_timeout_secs: batch.task_timeout_secs.map(|s| s as f64),
            resume: false,
            retry_policy: batch.retry_policy,
            critical_policy: memory.critical_policy,
            recovery_poll_ms: memory.recovery_poll_ms,
            max_recovery_polls: memory.max_recovery_polls,
            run_metadata: BTreeMap::new(),
        }
    }

    pub fn concurrency(&self) -> Result<Concurrency, CoreError> {
        Concurrency::from_jobs(self.jobs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn recovery_poll(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_ms)
    }

    pub fn checkpoint_every(&self) -> usize {
        self.checkpoint_frequency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_mapping() {
        assert_eq!(Concurrency::from_jobs(1).unwrap(), Concurrency::Sequential);
        assert_eq!(Concurrency::from_jobs(4).unwrap(), Concurrency::Fixed(4));
        assert_eq!(Concurrency::from_jobs(-1).unwrap(), Concurrency::AllUnits);
        assert!(Concurrency::from_jobs(0).is_err());
        assert!(Concurrency::from_jobs(-2).is_err());
    }

    #[test]
    fn all_units_resolves_to_at_least_one() {
        assert!(Concurrency::AllUnits.workers() >= 1);
        assert_eq!(Concurrency::Fixed(3).workers(), 3);
        assert_eq!(Concurrency::Sequential.workers(), 1);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"jobs": 4}"#).unwrap();
        assert_eq!(config.jobs, 4);
        assert_eq!(config.checkpoint_frequency, 10);
        assert!(config.task_timeout().is_none());
        assert_eq!(config.retry_policy, RetryPolicy::RetryFailed);
    }

    #[test]
    fn from_configs_copies_policies() {
        let batch = BatchConfig { jobs: 8, task_timeout_secs: Some(30), ..BatchConfig::default() };
        let memory = MemoryConfig { critical_policy: CriticalPolicy::Abort, ..MemoryConfig::default() };
        let config = SchedulerConfig::from_configs(&batch, &memory);
        assert_eq!(config.concurrency().unwrap(), Concurrency::Fixed(8));
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.critical_policy, CriticalPolicy::Abort);
    }
}
