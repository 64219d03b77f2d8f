mod cli;
mod config;
mod executor;

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use batchwise_compute::{
    BatchError, BatchOutcome, BatchScheduler, CheckpointRecord, CheckpointStore, DiskCheck, MemoryMonitor, RunState,
    SchedulerConfig, StopReason, TracingObserver,
};
use batchwise_core::{input, Config, TaskId};
use batchwise_matrix::{MatrixCache, TriangularMatrix};

use crate::cli::{CliArgs, Command, OutputArgs, RunArgs};
use crate::executor::CommandExecutor;

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

async fn dispatch(args: CliArgs) -> Result<ExitCode> {
    match args.command {
        Command::Run(run) => {
            let mut config = config::load_base(args.config.as_deref())?;
            config::apply_run_args(&mut config, &run);
            config.validate().context("invalid configuration")?;
            config.log_summary();
            run_batch(run, config).await
        }
        Command::Status(status) => {
            let config = output_config(args.config.as_deref(), &status.output)?;
            show_status(&config, status.input.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear(out) => {
            let config = output_config(args.config.as_deref(), &out)?;
            let store = CheckpointStore::new(config.batch.checkpoint_dir());
            if store.clear()? {
                println!("Checkpoint cleared: {}", store.dir().display());
            } else {
                println!("No checkpoint in {}", store.dir().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::MatrixInfo { file } => {
            let matrix = TriangularMatrix::restore(&file)
                .with_context(|| format!("failed to read matrix: {}", file.display()))?;
            let report = matrix.memory_report();
            println!("Matrix:      {}", file.display());
            println!("Items:       {}", matrix.n());
            println!("Values:      {}", matrix.len());
            println!(
                "Memory:      {:.2} MB triangular vs {:.2} MB dense ({:.1}% saved)",
                report.triangular_mb(),
                report.dense_mb(),
                report.saved_percent
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::CacheClear { dir } => {
            let removed = MatrixCache::new(&dir, 1)
                .clear()
                .with_context(|| format!("failed to clear cache: {}", dir.display()))?;
            println!("Removed {} cached matrices from {}", removed, dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn output_config(path: Option<&Path>, out: &OutputArgs) -> Result<Config> {
    let mut config = config::load_base(path)?;
    config::apply_output(&mut config, out);
    Ok(config)
}

fn show_status(config: &Config, input: Option<&Path>) -> Result<()> {
    let store = CheckpointStore::new(config.batch.checkpoint_dir());
    match store.load_record()? {
        None => println!("No checkpoint in {}", store.dir().display()),
        Some(record) => {
            println!("Checkpoint:  {}", store.metadata_path().display());
            println!("Saved at:    {}", record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Completed:   {}", record.n_completed);
            println!("Failed:      {}", record.failed_ids.len());
            println!("Pending:     {}", record.n_pending);
            if let Some(path) = input {
                let pending = pending_in_file(&record, path)?;
                println!("To run:      {} of {}", pending.len(), path.display());
            }
        }
    }
    Ok(())
}

/// Tasks in `path` that a `--resume` run would still execute.
fn pending_in_file(record: &CheckpointRecord, path: &Path) -> Result<Vec<TaskId>> {
    let tasks = input::load_tasks_from_file(path)
        .with_context(|| format!("failed to load tasks: {}", path.display()))?;
    let ids: Vec<TaskId> = tasks.into_iter().map(|t| t.id).collect();
    Ok(record.pending_for(&ids))
}

async fn run_batch(args: RunArgs, config: Config) -> Result<ExitCode> {
    let tasks = input::load_tasks_from_file(&args.input)
        .with_context(|| format!("failed to load tasks: {}", args.input.display()))?;
    info!(tasks = tasks.len(), input = %args.input.display(), "Loaded tasks");

    let observer = TracingObserver::shared();
    let mut sched_config = SchedulerConfig::from_configs(&config.batch, &config.memory);
    sched_config.resume = args.resume;
    sched_config
        .run_metadata
        .insert("command".to_string(), args.command.clone().into());
    sched_config
        .run_metadata
        .insert("input".to_string(), args.input.display().to_string().into());

    let mut scheduler = BatchScheduler::new(sched_config).with_observer(observer.clone());
    if config.batch.checkpoints_enabled {
        scheduler = scheduler.with_checkpoint_store(
            CheckpointStore::new(config.batch.checkpoint_dir()).with_observer(observer.clone()),
        );
    }
    if config.memory.enabled {
        scheduler = scheduler
            .with_memory_monitor(MemoryMonitor::new(config.memory.clone()).with_observer(observer.clone()));
    }
    if config.batch.check_space {
        scheduler = scheduler.with_disk_check(DiskCheck {
            path: config.batch.output_dir.clone(),
            base_mb: config.batch.disk_base_mb,
            per_task_mb: config.batch.disk_per_task_mb,
        });
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let shutdown = scheduler.shutdown_signal();
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            os_signal().await;
            warn!("Interrupt received, finishing in-flight tasks");
            interrupted.store(true, Ordering::SeqCst);
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let timeout = config.batch.task_timeout_secs.map(Duration::from_secs);
    let executor = Arc::new(CommandExecutor::new(args.command.clone(), timeout));
    let outcome = tokio::task::spawn_blocking(move || scheduler.run(tasks, executor))
        .await
        .context("batch thread panicked")?;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(BatchError::Aborted { used_percent, outcome }) => {
            write_results(&config, &outcome)?;
            error!(
                used_percent,
                completed = outcome.results.len(),
                "Batch aborted; resume with --resume once memory is available"
            );
            return Ok(ExitCode::from(EXIT_FAILED));
        }
        Err(e @ BatchError::ResourceExhausted { .. }) => {
            error!(error = %e, "Batch not started; free memory and retry");
            return Ok(ExitCode::from(EXIT_FAILED));
        }
        Err(e) => return Err(e).context("batch failed"),
    };

    write_results(&config, &outcome)?;
    let code = exit_code(
        outcome.state,
        outcome.stop_reason,
        outcome.summary.failed,
        interrupted.load(Ordering::SeqCst),
    );
    Ok(ExitCode::from(code))
}

/// Write `batch_results.json` and print the summary, for finished and aborted runs alike.
fn write_results(config: &Config, outcome: &BatchOutcome) -> Result<()> {
    let results_path = config::results_path(config);
    outcome
        .report()
        .write(&results_path)
        .with_context(|| format!("failed to write results: {}", results_path.display()))?;
    println!("{}", outcome.summary);
    info!(path = %results_path.display(), "Results written");
    Ok(())
}

/// 0 = every task succeeded, 130 = interrupted, 1 = anything else.
fn exit_code(state: RunState, stop: Option<StopReason>, failed: usize, interrupted: bool) -> u8 {
    match (state, stop) {
        (RunState::Cancelled, Some(StopReason::Cancelled)) if interrupted => EXIT_INTERRUPTED,
        (RunState::Completed, _) if failed == 0 => 0,
        _ => EXIT_FAILED,
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                warn!("Could not register signal handlers, falling back to ctrl_c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
