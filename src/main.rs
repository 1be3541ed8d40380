//! Bundle Orchestrator
//!
//! Reconciles the upload filesystem against `folderStatus.json` and drives
//! the secondary channel of each bundle through the inference service, one
//! call at a time.
//!
//! # Usage
//!
//! ```bash
//! # Run both background loops until Ctrl+C
//! bundle-orchestrator run
//!
//! # Print processed / unprocessed bundles
//! bundle-orchestrator status
//!
//! # Seed a record the way the upload handler does
//! bundle-orchestrator seed rec_2025_03_01_1015
//! ```
//!
//! # Environment Variables
//!
//! - `ORCHESTRATOR_CONFIG`: Path to the TOML config file
//! - `RECONCILE_INTERVAL_SECS`, `SCHEDULE_INTERVAL_SECS`: Loop intervals
//! - `INFERENCE_ENDPOINT`: Inference service URL
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bundle_orchestrator::scheduler::SchedulerSettings;
use bundle_orchestrator::{
    FolderReconciler, HttpInferenceClient, OrchestratorConfig, ProcessingScheduler, StatusStore,
    StoreLock,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "bundle-orchestrator")]
#[command(about = "Folder lifecycle reconciliation and inference scheduling for media bundles")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (takes precedence over ORCHESTRATOR_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the folder reconciler and the processing scheduler (default)
    Run,

    /// Print the processed / unprocessed summary as JSON
    Status {
        /// Print the whole status document instead of the summary
        #[arg(long)]
        full: bool,
    },

    /// Seed a status record for an extracted bundle
    ///
    /// Takes the status-file lock, so it is refused while `run` owns the same
    /// status file. An ingester living inside the running process calls
    /// `StatusStore::seed` instead.
    Seed {
        /// Bundle identity (directory name under the upload root)
        identity: String,
    },

    /// Run a single reconciliation pass and exit
    Reconcile,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    FolderReconciler,
    ProcessingScheduler,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::FolderReconciler => write!(f, "FolderReconciler"),
            TaskName::ProcessingScheduler => write!(f, "ProcessingScheduler"),
        }
    }
}

// ============================================================================
// Setup
// ============================================================================

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stderr keeps stdout clean for `status` output
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match explicit {
        Some(path) => {
            let mut config = OrchestratorConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => OrchestratorConfig::load(),
    };
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Supervisor
// ============================================================================

async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: OrchestratorConfig) -> Result<()> {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Bundle Orchestrator");
    info!("  uploads:   {}", config.paths.uploads_dir.display());
    info!("  records:   {}", config.paths.records_dir.display());
    info!("  status:    {}", config.paths.status_file.display());
    info!("  inference: {}", config.inference.endpoint);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for dir in [&config.paths.uploads_dir, &config.paths.records_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let _lock = StoreLock::acquire(&config.paths.status_file)
        .context("Failed to take ownership of the status file")?;

    let store = Arc::new(StatusStore::new(&config.paths.status_file));
    let client = HttpInferenceClient::new(&config.inference.endpoint, config.inference_timeout())
        .context("Failed to build inference client")?;

    let reconciler = FolderReconciler::new(
        Arc::clone(&store),
        &config.paths.uploads_dir,
        &config.paths.records_dir,
        config.reconcile_interval(),
    );
    let scheduler = ProcessingScheduler::new(
        Arc::clone(&store),
        Arc::new(client),
        SchedulerSettings::from_config(&config),
    );

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let reconciler_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[FolderReconciler] Task starting");
        reconciler.run(reconciler_cancel).await;
        Ok(TaskName::FolderReconciler)
    });

    let scheduler_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[ProcessingScheduler] Task starting");
        scheduler.run(scheduler_cancel).await;
        Ok(TaskName::ProcessingScheduler)
    });

    let supervised = run_supervisor(&mut task_set, cancel_token.clone()).await;

    cancel_token.cancel();
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("[{}] Stopped", task_name),
            Ok(Err(e)) => warn!("Task stopped with error: {}", e),
            Err(e) => warn!("Task ended abnormally: {}", e),
        }
    }

    supervised?;
    info!("✓ Bundle Orchestrator shutdown complete");
    Ok(())
}

fn print_status(config: &OrchestratorConfig, full: bool) -> Result<()> {
    let doc = StatusStore::new(&config.paths.status_file).snapshot();
    let json = if full {
        serde_json::to_string_pretty(&doc)?
    } else {
        serde_json::to_string_pretty(&doc.summary())?
    };
    println!("{json}");
    Ok(())
}

async fn seed(config: &OrchestratorConfig, identity: &str) -> Result<()> {
    let _lock = StoreLock::acquire(&config.paths.status_file)
        .context("Failed to take ownership of the status file")?;

    let outcome = StatusStore::new(&config.paths.status_file)
        .seed(identity)
        .await
        .with_context(|| format!("Failed to seed {identity}"))?;
    println!("{identity}: {outcome:?}");
    Ok(())
}

async fn reconcile_once(config: &OrchestratorConfig) -> Result<()> {
    let _lock = StoreLock::acquire(&config.paths.status_file)
        .context("Failed to take ownership of the status file")?;

    let reconciler = FolderReconciler::new(
        Arc::new(StatusStore::new(&config.paths.status_file)),
        &config.paths.uploads_dir,
        &config.paths.records_dir,
        config.reconcile_interval(),
    );
    let report = reconciler.run_pass().await?;
    println!(
        "created={} refreshed={} finalized={} tombstoned={} reappeared={}",
        report.created,
        report.refreshed,
        report.finalized,
        report.tombstoned,
        report.reappeared.len()
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_deref())?;

    match args.command.unwrap_or(SubCommand::Run) {
        SubCommand::Run => run(config).await,
        SubCommand::Status { full } => print_status(&config, full),
        SubCommand::Seed { identity } => seed(&config, &identity).await,
        SubCommand::Reconcile => reconcile_once(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_run() {
        let args = CliArgs::try_parse_from(["bundle-orchestrator", "--json-logs"]).unwrap();
        assert!(args.json_logs);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_seed_help_mentions_lock() {
        let cmd = CliArgs::command();
        let seed = cmd.find_subcommand("seed").unwrap();
        let help = seed.get_long_about().unwrap().to_string();
        assert!(help.contains("lock"));
        assert!(help.contains("StatusStore::seed"));
    }
}
