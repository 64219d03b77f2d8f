use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// `--jobs` value meaning "use every available execution unit".
pub const ALL_UNITS_JOBS: i64 = -1;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Policies ──────────────────────────────────────────────────

/// What the scheduler does when memory pressure reaches `Critical` mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriticalPolicy {
    /// Stop dispatching, let in-flight tasks finish, wait for memory to recover.
    #[default]
    Throttle,
    /// Stop dispatching, drain in-flight tasks, then fail the batch.
    Abort,
}

impl FromStr for CriticalPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "throttle" => Ok(CriticalPolicy::Throttle),
            "abort" => Ok(CriticalPolicy::Abort),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown critical memory policy '{}' (expected throttle or abort)",
                other
            ))),
        }
    }
}

/// How previously failed tasks are treated when a batch resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Failed tasks are executed again.
    #[default]
    RetryFailed,
    /// Failed tasks keep their recorded failure and are not executed again.
    SkipFailed,
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub batch: BatchConfig,
    pub memory: MemoryConfig,
    pub matrix: MatrixConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BATCHWISE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("BATCHWISE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            batch: BatchConfig::from_env_profiled(p),
            memory: MemoryConfig::from_env_profiled(p),
            matrix: MatrixConfig::from_env_profiled(p),
            logging: LoggingConfig::from_env_profiled(p),
        }
    }

    /// Load a TOML config file. Missing sections and keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        self.memory.validate()?;
        self.matrix.validate()?;
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  batch:    jobs={}, output={}, checkpoints={} (every {}), timeout={}",
            self.batch.jobs,
            self.batch.output_dir.display(),
            if self.batch.checkpoints_enabled { "on" } else { "off" },
            self.batch.checkpoint_frequency,
            self.batch
                .task_timeout_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "none".to_string())
        );
        tracing::info!(
            "  memory:   monitor={}, warning={:.0}%, critical={:.0}%, cleanup every {}, policy={:?}",
            self.memory.enabled,
            self.memory.warning_percent,
            self.memory.critical_percent,
            self.memory.cleanup_frequency,
            self.memory.critical_policy
        );
        tracing::info!(
            "  matrix:   cache={}, dir={}",
            self.matrix.cache_enabled,
            self.matrix.cache_dir.display()
        );
    }
}

// ── Batch ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 1 = sequential, N = fixed pool, -1 = all available units.
    pub jobs: i64,
    pub output_dir: PathBuf,
    pub checkpoints_enabled: bool,
    /// Defaults to `<output_dir>/.checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_frequency: usize,
    pub task_timeout_secs: Option<u64>,
    pub retry_policy: RetryPolicy,
    /// Run the disk-space pre-flight check.
    pub check_space: bool,
    pub disk_base_mb: f64,
    pub disk_per_task_mb: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            output_dir: PathBuf::from("batch_output"),
            checkpoints_enabled: true,
            checkpoint_dir: None,
            checkpoint_frequency: 10,
            task_timeout_secs: None,
            retry_policy: RetryPolicy::RetryFailed,
            check_space: false,
            disk_base_mb: 120.0,
            disk_per_task_mb: 20.0,
        }
    }
}

impl BatchConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            jobs: profiled_env_parse(p, "BATCH_JOBS", d.jobs),
            output_dir: profiled_env_opt(p, "BATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.output_dir),
            checkpoints_enabled: profiled_env_bool(p, "BATCH_CHECKPOINTS", d.checkpoints_enabled),
            checkpoint_dir: profiled_env_opt(p, "BATCH_CHECKPOINT_DIR").map(PathBuf::from),
            checkpoint_frequency: profiled_env_parse(p, "BATCH_CHECKPOINT_FREQ", d.checkpoint_frequency),
            task_timeout_secs: profiled_env_opt(p, "BATCH_TASK_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            retry_policy: if profiled_env_bool(p, "BATCH_SKIP_FAILED", false) {
                RetryPolicy::SkipFailed
            } else {
                RetryPolicy::RetryFailed
            },
            check_space: profiled_env_bool(p, "BATCH_CHECK_SPACE", d.check_space),
            disk_base_mb: profiled_env_parse(p, "DISK_BASE_MB", d.disk_base_mb),
            disk_per_task_mb: profiled_env_parse(p, "DISK_PER_TASK_MB", d.disk_per_task_mb),
        }
    }

    /// Resolved checkpoint directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".checkpoints"))
    }

    fn validate(&self) -> Result<()> {
        if self.jobs != ALL_UNITS_JOBS && self.jobs < 1 {
            return Err(CoreError::InvalidConfig(format!(
                "jobs must be >= 1 or {} (all units), got {}",
                ALL_UNITS_JOBS, self.jobs
            )));
        }
        if self.checkpoint_frequency == 0 {
            return Err(CoreError::InvalidConfig(
                "checkpoint_frequency must be >= 1".to_string(),
            ));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(CoreError::InvalidConfig(
                "task_timeout_secs must be >= 1 when set".to_string(),
            ));
        }
        if self.disk_base_mb < 0.0 || self.disk_per_task_mb < 0.0 {
            return Err(CoreError::InvalidConfig(
                "disk space estimates must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Memory ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// System memory usage (percent) classified as `Warning`.
    pub warning_percent: f64,
    /// System memory usage (percent) classified as `Critical`.
    pub critical_percent: f64,
    pub auto_cleanup: bool,
    /// Run cleanup every N tracked operations.
    pub cleanup_frequency: usize,
    pub critical_policy: CriticalPolicy,
    /// Delay between memory re-checks while dispatch is paused.
    pub recovery_poll_ms: u64,
    /// Re-checks allowed before a paused run gives up.
    pub max_recovery_polls: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_percent: 75.0,
            critical_percent: 90.0,
            auto_cleanup: true,
            cleanup_frequency: 10,
            critical_policy: CriticalPolicy::Throttle,
            recovery_poll_ms: 1000,
            max_recovery_polls: 30,
        }
    }
}

impl MemoryConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(p, "MEMORY_MONITOR", d.enabled),
            warning_percent: profiled_env_parse(p, "MEMORY_WARNING_PERCENT", d.warning_percent),
            critical_percent: profiled_env_parse(p, "MEMORY_CRITICAL_PERCENT", d.critical_percent),
            auto_cleanup: profiled_env_bool(p, "MEMORY_AUTO_CLEANUP", d.auto_cleanup),
            cleanup_frequency: profiled_env_parse(p, "MEMORY_CLEANUP_FREQ", d.cleanup_frequency),
            critical_policy: profiled_env_opt(p, "MEMORY_CRITICAL_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.critical_policy),
            recovery_poll_ms: profiled_env_parse(p, "MEMORY_RECOVERY_POLL_MS", d.recovery_poll_ms),
            max_recovery_polls: profiled_env_parse(p, "MEMORY_MAX_RECOVERY_POLLS", d.max_recovery_polls),
        }
    }

    fn validate(&self) -> Result<()> {
        let ordered = self.warning_percent > 0.0
            && self.warning_percent < self.critical_percent
            && self.critical_percent <= 100.0;
        if !ordered {
            return Err(CoreError::InvalidConfig(format!(
                "memory thresholds must satisfy 0 < warning < critical <= 100 (got {} / {})",
                self.warning_percent, self.critical_percent
            )));
        }
        if self.cleanup_frequency == 0 {
            return Err(CoreError::InvalidConfig(
                "cleanup_frequency must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Matrix cache ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    /// Matrices kept in the in-memory LRU in front of the disk cache.
    pub memory_entries: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_dir: PathBuf::from(".cache/matrices"),
            memory_entries: 16,
        }
    }
}

impl MatrixConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            cache_enabled: profiled_env_bool(p, "MATRIX_CACHE", d.cache_enabled),
            cache_dir: profiled_env_opt(p, "MATRIX_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.cache_dir),
            memory_entries: profiled_env_parse(p, "MATRIX_MEMORY_ENTRIES", d.memory_entries),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.memory_entries == 0 {
            return Err(CoreError::InvalidConfig(
                "matrix memory_entries must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            level: profiled_env_opt(p, "LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }
}
