//! CLI entry point for the Docling batch orchestrator
//!
//! `start` runs the daemon in the foreground; the other commands talk to a
//! running daemon over its status endpoint or work on the shared store.

use clap::{Parser, Subcommand};
use docling_orchestrator::aggregator::ProgressAggregator;
use docling_orchestrator::config::CANDIDATE_CONFIG_FILES;
use docling_orchestrator::lifecycle::process_alive;
use docling_orchestrator::{
    current_timestamp_ms, open_store, read_lock, BatchReport, BatchRegistry, Config, Daemon,
    LifecycleState, ProcessedLedger, StatusReport,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Docling batch orchestrator - converts batch directories of documents to markdown
#[derive(Parser, Debug)]
#[command(name = "docling-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; defaults to config.local.toml, then config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Start {
        /// Skip the conversion engine check. For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Ask the running daemon to shut down and wait for it
    Stop,
    /// Show lifecycle state and per-batch progress
    Status {
        /// Print the raw status report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop the running daemon, then start in the foreground
    Restart {
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Forget one processed directory so the next scan claims it again
    ClearClaim {
        /// Batch directory, as found under the watch directory
        dir: PathBuf,
    },
    /// Forget every processed directory
    ResetLedger,
    /// Fail every unresolved file of a batch and mark it cancelled
    CancelBatch {
        /// Batch id as shown by `status`
        batch_id: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(explicit: Option<&Path>) -> CliResult<Config> {
    let resolved = Config::resolve(explicit, Path::new("."), CANDIDATE_CONFIG_FILES)?;
    match &resolved.source {
        Some(path) => info!(config = %path.display(), "Loaded configuration"),
        None => info!("No configuration file found; using defaults"),
    }
    Ok(resolved.config)
}

async fn start(config: Config, skip_checks: bool) -> CliResult<()> {
    let daemon = if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)?
    } else {
        Daemon::new(config)?
    };

    let cancel = daemon.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
    });

    info!(
        watch = %daemon.config.daemon.watch_directory.display(),
        status = %daemon.config.daemon.status_addr,
        "Daemon starting"
    );
    daemon.run_with_server().await?;
    info!("Daemon stopped");
    Ok(())
}

fn http_client() -> CliResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?)
}

async fn stop(config: &Config) -> CliResult<()> {
    let lock_file = &config.daemon.lock_file;
    let Some(owner) = read_lock(lock_file)? else {
        println!("daemon: stopped");
        return Ok(());
    };
    if !process_alive(owner.pid) {
        println!("daemon: stopped (stale lock from pid {})", owner.pid);
        return Ok(());
    }

    let url = format!("http://{}/shutdown", owner.status_addr);
    http_client()?
        .post(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("daemon (pid {}) did not accept shutdown: {}", owner.pid, e))?;
    println!("Shutdown requested (pid {})", owner.pid);

    let wait = Duration::from_secs(config.daemon.shutdown_timeout + 10);
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        match read_lock(lock_file) {
            Ok(Some(current)) if current.instance_id == owner.instance_id => {}
            _ => {
                println!("daemon: stopped");
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Err(format!("daemon (pid {}) still running after {}s", owner.pid, wait.as_secs()).into())
}

async fn fetch_status(config: &Config) -> Option<StatusReport> {
    let url = format!("http://{}/status", config.daemon.status_addr);
    let response = http_client().ok()?.get(&url).send().await.ok()?;
    response.error_for_status().ok()?.json().await.ok()
}

/// Status read straight from the store while the daemon is down.
fn offline_status(config: &Config) -> CliResult<StatusReport> {
    let registry = Arc::new(BatchRegistry::new(open_store(config)?));
    let aggregator = ProgressAggregator::new(registry, config.audit_delay_seconds);
    let now = current_timestamp_ms();
    Ok(StatusReport {
        timestamp_unix_ms: now,
        lifecycle: LifecycleState::Stopped,
        batches: aggregator.all(now)?,
        ..StatusReport::default()
    })
}

fn print_batch_table(batches: &[BatchReport]) {
    if batches.is_empty() {
        println!("no batches");
        return;
    }
    println!(
        "{:<28} {:<12} {:>6} {:>6} {:>6} {:>9} {:>9}  {}",
        "BATCH", "STATUS", "TOTAL", "OK", "FAILED", "FALLBACK", "IN-FLIGHT", "SUMMARY"
    );
    for b in batches {
        println!(
            "{:<28} {:<12} {:>6} {:>6} {:>6} {:>9} {:>9}  {}",
            b.batch_id,
            b.status.as_str(),
            b.total,
            b.succeeded,
            b.failed,
            b.fallback_pending,
            b.in_flight,
            b.summary
        );
    }
}

async fn status(config: &Config, json: bool) -> CliResult<()> {
    let report = match fetch_status(config).await {
        Some(report) => report,
        None => offline_status(config)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.lifecycle == LifecycleState::Stopped {
        println!("daemon: stopped");
    } else {
        println!(
            "daemon: {} (pid {}, instance {}) on {}",
            report.lifecycle, report.pid, report.instance_id, config.daemon.status_addr
        );
        let queues: Vec<String> = report
            .queue_depths
            .iter()
            .map(|(name, depth)| format!("{}={}", name, depth))
            .collect();
        println!(
            "queues: {}  running: {}  converted: {}  failed: {}",
            queues.join(" "),
            report.running_jobs,
            report.completed_files,
            report.failed_files
        );
    }
    print_batch_table(&report.batches);
    Ok(())
}

fn clear_claim(config: &Config, dir: &Path) -> CliResult<()> {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let store = open_store(config)?;
    let registry = BatchRegistry::new(store.clone());
    if ProcessedLedger::new(store).clear_claim(&dir, &registry)? {
        println!("Cleared claim on {}", dir.display());
    } else {
        println!("{} was not claimed", dir.display());
    }
    Ok(())
}

fn reset_ledger(config: &Config) -> CliResult<()> {
    let cleared = ProcessedLedger::new(open_store(config)?).reset()?;
    println!("Cleared {} processed directories", cleared);
    Ok(())
}

fn cancel_batch(config: &Config, batch_id: &str) -> CliResult<usize> {
    let registry = BatchRegistry::new(open_store(config)?);
    let cancelled = registry.cancel_batch(batch_id)?;
    info!(batch_id, cancelled, "Batch cancelled");
    println!("Cancelled {} file(s) of batch {}", cancelled, batch_id);
    Ok(cancelled)
}

async fn run(args: Args) -> CliResult<()> {
    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Start { skip_checks } => start(config, skip_checks).await,
        Command::Stop => stop(&config).await,
        Command::Status { json } => status(&config, json).await,
        Command::Restart { skip_checks } => {
            stop(&config).await?;
            start(config, skip_checks).await
        }
        Command::ClearClaim { dir } => clear_claim(&config, &dir),
        Command::ResetLedger => reset_ledger(&config),
        Command::CancelBatch { batch_id } => cancel_batch(&config, &batch_id).map(|_| ()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use docling_orchestrator::aggregator::BatchStatus;
    use docling_orchestrator::config::Pipeline;
    use docling_orchestrator::registry::{Batch, FileRecord};
    use docling_orchestrator::Job;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::parse_from(["docling-orchestrator", "--config", "c.toml", "status", "--json"]);
        assert_eq!(args.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(args.command, Command::Status { json: true }));

        let args = Args::parse_from(["docling-orchestrator", "clear-claim", "/in/batch-1"]);
        assert!(matches!(args.command, Command::ClearClaim { dir } if dir == PathBuf::from("/in/batch-1")));

        let args = Args::parse_from(["docling-orchestrator", "start", "--skip-checks"]);
        assert!(matches!(args.command, Command::Start { skip_checks: true }));

        let args = Args::parse_from(["docling-orchestrator", "cancel-batch", "batch-7"]);
        assert!(matches!(args.command, Command::CancelBatch { batch_id } if batch_id == "batch-7"));
    }

    #[test]
    fn test_cancel_batch_shows_in_offline_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.redis.url = format!("sqlite://{}", dir.path().join("state.db").display());

        let registry = BatchRegistry::new(open_store(&config).unwrap());
        let batch = Batch::new("b1", PathBuf::from("/in/b1"), PathBuf::from("/out/b1"), 2, Pipeline::Standard);
        let files: Vec<FileRecord> = ["a.pdf", "b.pdf"]
            .iter()
            .map(|name| {
                FileRecord::from_job(&Job::primary(
                    "b1",
                    name,
                    PathBuf::from("/in/b1").join(name),
                    PathBuf::from("/out/b1"),
                    Pipeline::Standard,
                ))
            })
            .collect();
        assert!(registry.claim_batch(&batch, &files).unwrap());

        assert_eq!(cancel_batch(&config, "b1").unwrap(), 2);
        let report = offline_status(&config).unwrap();
        assert_eq!(report.batches[0].status, BatchStatus::Cancelled);
        assert_eq!(report.batches[0].failed, 2);

        assert!(cancel_batch(&config, "missing").is_err());
    }

    #[test]
    fn test_offline_status_reads_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.redis.url = format!("sqlite://{}", dir.path().join("state.db").display());
        let report = offline_status(&config).unwrap();
        assert_eq!(report.lifecycle, LifecycleState::Stopped);
        assert!(report.batches.is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_lock_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.lock_file = dir.path().join("daemon.lock");
        stop(&config).await.unwrap();
    }
}
