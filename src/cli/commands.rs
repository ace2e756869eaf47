//! CLI command definitions for ingest-forge.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::manager::{AcceleratorMode, Manager, ManagerConfig};
use crate::storage::TaskStore;

/// Watch a directory and process every file that lands in it, exactly once.
#[derive(Parser)]
#[command(name = "ingest-forge")]
#[command(about = "Crash-recoverable directory ingestion with a bounded worker pool")]
#[command(version)]
#[command(
    long_about = "ingest-forge watches a directory, records every matching file in a SQLite task store and dispatches it to a pool of workers.\n\nFiles end up in the processed or error directory; progress survives restarts.\n\nExample usage:\n  ingest-forge run --config ingest.yaml --workers 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file. `INGEST_*` environment variables override it.
    #[arg(short, long, env = "INGEST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run until interrupted (Ctrl-C).
    Run(RunArgs),

    /// Print task counts and worker checkpoints from the task store.
    Stats(StatsArgs),

    /// Run one scan pass over the watch directory and print the report.
    Scan(ScanArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of workers (overrides the configuration).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Seconds between periodic stats log lines.
    #[arg(long, default_value = "30")]
    pub stats_interval: u64,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Print JSON instead of a one-line summary.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = ManagerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Commands::Run(args) => run_command(config, args).await,
        Commands::Stats(args) => stats_command(config, args).await,
        Commands::Scan(args) => scan_command(config, args).await,
    }
}

async fn run_command(mut config: ManagerConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
        config.validate()?;
    }

    let mut manager = Manager::new(config).await?;
    manager.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Interrupt received, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let stats = manager.stats().await?;
                info!(
                    queue_depth = stats.queue_depth,
                    tasks_processed = stats.tasks_processed,
                    tasks_failed = stats.tasks_failed,
                    paused = stats.paused,
                    accelerator_memory_used = stats.accelerator_memory_used,
                    "Status"
                );
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

async fn stats_command(config: ManagerConfig, args: StatsArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;
    let store = TaskStore::open(config.database_path()).await?;
    let stats = store.stats().await?;
    store.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\n=== Tasks ===");
    println!("Pending:    {}", stats.tasks.pending);
    println!("Processing: {}", stats.tasks.processing);
    println!("Completed:  {}", stats.tasks.completed);
    println!("Failed:     {}", stats.tasks.failed);
    println!("Total:      {}", stats.tasks.total());

    if !stats.checkpoints.is_empty() {
        println!("\n=== Workers ===");
        for checkpoint in stats.checkpoints.values() {
            println!(
                "{:<12} {:<10} processed={:<6} failed={:<6} avg={:.2}s last={}",
                checkpoint.worker_id,
                checkpoint.state,
                checkpoint.files_processed,
                checkpoint.files_failed,
                checkpoint.average_processing_time().as_secs_f64(),
                checkpoint.last_checkpoint.to_rfc3339(),
            );
        }
    }
    Ok(())
}

async fn scan_command(config: ManagerConfig, args: ScanArgs) -> anyhow::Result<()> {
    let manager = Manager::new(config.with_accelerator(AcceleratorMode::Off)).await?;
    let report = manager.scan_once().await?;
    manager.store().close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}
