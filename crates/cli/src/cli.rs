use std::path::PathBuf;

use batchwise_core::CriticalPolicy;
use clap::{Args, Parser, Subcommand};

/// Resumable, resource-aware batch runner.
///
/// Runs one shell command per task, checkpoints progress, and resumes
/// interrupted batches without redoing finished work.
#[derive(Parser, Debug)]
#[command(name = "batchwise", version, about = "Resumable, resource-aware batch runner")]
pub struct CliArgs {
    /// Debug-level logging (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// TOML config file (default: environment / .env)
    #[arg(long, global = true, env = "BATCHWISE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a batch of tasks
    Run(RunArgs),
    /// Show the checkpoint of an interrupted batch
    Status(StatusArgs),
    /// Delete the checkpoint of an interrupted batch
    Clear(OutputArgs),
    /// Print size and memory report of a persisted matrix
    MatrixInfo {
        file: PathBuf,
    },
    /// Delete every cached matrix in a cache directory
    CacheClear {
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
pub struct OutputArgs {
    /// Output directory (checkpoints live in <output>/.checkpoints)
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    #[command(flatten)]
    pub output: OutputArgs,

    /// Task file to compare against the checkpoint
    #[arg(long, short)]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Task file: .json list or CSV with a header line
    #[arg(long, short)]
    pub input: PathBuf,

    /// Shell command run once per task (task JSON on stdin)
    #[arg(long = "exec", short = 'e')]
    pub command: String,

    /// Parallel jobs: 1 = sequential, N = pool of N, -1 = all CPUs
    #[arg(long, short, allow_negative_numbers = true)]
    pub jobs: Option<i64>,

    /// Resume from the last checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Disable checkpointing
    #[arg(long)]
    pub no_checkpoints: bool,

    /// Save a checkpoint every N finished tasks
    #[arg(long)]
    pub checkpoint_freq: Option<usize>,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Per-task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// What to do when memory reaches the critical threshold
    #[arg(long, value_parser = parse_policy)]
    pub on_critical: Option<CriticalPolicy>,

    /// On resume, keep previous failures instead of retrying them
    #[arg(long)]
    pub skip_failed: bool,

    /// Check free disk space before starting
    #[arg(long)]
    pub check_space: bool,
}

fn parse_policy(s: &str) -> Result<CriticalPolicy, String> {
    s.parse::<CriticalPolicy>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let args = CliArgs::try_parse_from([
            "batchwise", "run", "--input", "tasks.csv", "--exec", "./score.sh", "--jobs", "-1",
            "--resume", "--timeout", "30", "--on-critical", "abort", "--skip-failed", "-o", "out",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.jobs, Some(-1));
        assert!(run.resume && run.skip_failed && !run.no_checkpoints);
        assert_eq!(run.timeout, Some(30));
        assert_eq!(run.on_critical, Some(CriticalPolicy::Abort));
        assert_eq!(run.output.output, Some(PathBuf::from("out")));
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = CliArgs::try_parse_from([
            "batchwise", "run", "-i", "t.json", "-e", "true", "--on-critical", "panic",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn parses_status_with_task_file() {
        let args = CliArgs::try_parse_from(["batchwise", "status", "-o", "out", "--input", "tasks.csv"]).unwrap();
        let Command::Status(status) = args.command else {
            panic!("expected status");
        };
        assert_eq!(status.output.output, Some(PathBuf::from("out")));
        assert_eq!(status.input, Some(PathBuf::from("tasks.csv")));

        let args = CliArgs::try_parse_from(["batchwise", "status"]).unwrap();
        assert!(matches!(args.command, Command::Status(StatusArgs { input: None, .. })));
    }

    #[test]
    fn parses_matrix_commands() {
        let args = CliArgs::try_parse_from(["batchwise", "-v", "matrix-info", "m.msgpack"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, Command::MatrixInfo { .. }));
        let args = CliArgs::try_parse_from(["batchwise", "cache-clear", ".cache"]).unwrap();
        assert!(matches!(args.command, Command::CacheClear { .. }));
    }
}
