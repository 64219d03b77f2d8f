use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use batchwise_core::config::load_dotenv;
use batchwise_core::{Config, RetryPolicy};
use tracing::debug;

use crate::cli::{OutputArgs, RunArgs};

/// Load the base config: the TOML file when given, else `.env` + environment.
pub fn load_base(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => {
            debug!(path = %p.display(), "Loading config file");
            Config::load(p).with_context(|| format!("failed to load config: {}", p.display()))
        }
        None => {
            load_dotenv();
            Ok(Config::from_env())
        }
    }
}

pub fn apply_output(config: &mut Config, args: &OutputArgs) {
    if let Some(dir) = &args.output {
        config.batch.output_dir = dir.clone();
    }
}

/// Command-line flags override individual config fields.
pub fn apply_run_args(config: &mut Config, args: &RunArgs) {
    apply_output(config, &args.output);
    if let Some(jobs) = args.jobs {
        config.batch.jobs = jobs;
    }
    if args.no_checkpoints {
        config.batch.checkpoints_enabled = false;
    }
    if let Some(freq) = args.checkpoint_freq {
        config.batch.checkpoint_frequency = freq;
    }
    if let Some(secs) = args.timeout {
        config.batch.task_timeout_secs = Some(secs);
    }
    if let Some(policy) = args.on_critical {
        config.memory.critical_policy = policy;
    }
    if args.skip_failed {
        config.batch.retry_policy = RetryPolicy::SkipFailed;
    }
    if args.check_space {
        config.batch.check_space = true;
    }
}

pub fn results_path(config: &Config) -> PathBuf {
    config.batch.output_dir.join("batch_results.json")
}
