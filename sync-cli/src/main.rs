use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use driver_sync::config::SyncConfig;
use driver_sync::network::is_reachable;
use driver_sync::{
    spawn_reachability_monitor, NetworkStatus, ReconcileOutcome, ReconciliationResult,
    RestRecordStore, SqliteScheduleStore, SyncEvent, SyncOutcome, SyncService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

mod logging;

/// Driver record sync operator tool
#[derive(Parser, Debug)]
#[command(name = "driverctl")]
#[command(about = "Reconcile driver identity records and run the background sync")]
struct Args {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "DRIVER_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile one driver by key
    Reconcile { key: String },

    /// Reconcile every active driver
    ReconcileAll,

    /// Run one sync attempt now
    Sync {
        /// Skip the in-progress and minimum-delay checks
        #[arg(long)]
        force: bool,
    },

    /// Run the background scheduler until interrupted
    Run {
        /// Override the configured interval
        #[arg(long)]
        interval_minutes: Option<u64>,
    },

    /// Show the persisted schedule state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    logging::init_tracing(args.verbose)?;

    let config =
        SyncConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let (service, monitor) = build_service(config).await?;

    let result = match args.command {
        Command::Reconcile { key } => reconcile(&service, &key).await,
        Command::ReconcileAll => reconcile_all(&service).await,
        Command::Sync { force } => sync_once(&service, force).await,
        Command::Run { interval_minutes } => run(&service, interval_minutes).await,
        Command::Status => status(&service),
    };

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    result
}

async fn build_service(config: SyncConfig) -> Result<(SyncService, Option<JoinHandle<()>>)> {
    let store = RestRecordStore::new(&config.store).context("failed to create record store")?;
    let state_store = SqliteScheduleStore::connect(&config.state)
        .await
        .with_context(|| format!("failed to open state database {}", config.state.db_path))?;

    let network = NetworkStatus::online();
    let monitor = match config.network.check_addr.clone() {
        Some(addr) => {
            network.set_online(is_reachable(&addr, config.network.check_timeout()).await);
            Some(spawn_reachability_monitor(
                network.clone(),
                addr,
                config.network.check_interval(),
                config.network.check_timeout(),
            ))
        }
        None => None,
    };

    let service = SyncService::builder()
        .store(Arc::new(store))
        .state_store(Arc::new(state_store))
        .network(network)
        .config(config)
        .build()
        .await?;

    Ok((service, monitor))
}

async fn reconcile(service: &SyncService, key: &str) -> Result<()> {
    let result = service.reconcile_entity(key).await;
    print_result(&result);

    if let Some(error) = result.error {
        return Err(error).with_context(|| format!("reconciliation of {key} failed"));
    }
    Ok(())
}

async fn reconcile_all(service: &SyncService) -> Result<()> {
    let report = service.reconcile_all().await?;

    for result in &report.details {
        print_result(result);
    }

    let summary = format!("{}/{} reconciled", report.successful, report.total);
    if report.successful == report.total {
        println!("{}", summary.bright_green());
        Ok(())
    } else {
        println!("{}", summary.bright_yellow());
        anyhow::bail!("{} reconciliation(s) failed", report.total - report.successful)
    }
}

async fn sync_once(service: &SyncService, force: bool) -> Result<()> {
    let outcome = service.trigger_sync_now(force).await;

    match &outcome {
        SyncOutcome::Success { timestamp } => {
            println!("{} at {}", "sync succeeded".bright_green(), timestamp.to_rfc3339());
            Ok(())
        }
        SyncOutcome::Skipped { reason } => {
            println!("{} ({})", "sync skipped".bright_yellow(), reason.as_str());
            Ok(())
        }
        SyncOutcome::Failed {
            error,
            consecutive_errors,
        } => {
            println!(
                "{}: {} ({} consecutive)",
                "sync failed".bright_red(),
                error,
                consecutive_errors
            );
            anyhow::bail!("sync failed: {error}")
        }
    }
}

async fn run(service: &SyncService, interval_minutes: Option<u64>) -> Result<()> {
    let subscription = service.on_event(print_event);

    service.start_scheduler(interval_minutes).await?;
    info!("Scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    service.stop_scheduler();
    subscription.unsubscribe();
    Ok(())
}

fn status(service: &SyncService) -> Result<()> {
    let status = service.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn print_result(result: &ReconciliationResult) {
    let outcome = match result.outcome {
        ReconcileOutcome::Created => "created".bright_green(),
        ReconcileOutcome::Updated => "updated".bright_cyan(),
        ReconcileOutcome::Noop => "noop".bright_white(),
        ReconcileOutcome::Failed => "failed".bright_red(),
    };

    match &result.error {
        Some(error) => println!("{:<12} {} {}", result.key, outcome, error),
        None => println!("{:<12} {}", result.key, outcome),
    }
}

fn print_event(event: &SyncEvent) {
    let line = serde_json::to_string(event).unwrap_or_else(|_| event.name().to_string());
    let line = match event {
        SyncEvent::SyncSuccess { .. } | SyncEvent::NetworkOnline => line.bright_green(),
        SyncEvent::SyncRetry { .. } | SyncEvent::NetworkOffline => line.bright_yellow(),
        SyncEvent::SyncFailed { .. } | SyncEvent::CircuitOpen { .. } => line.bright_red(),
        _ => line.normal(),
    };
    println!("{line}");
}
