mod config;
mod logging;
mod render;
mod wallets;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::{Severity, TaskStatus};
use fleet_engine_client::EngineClient;
use fleet_monitor::{Monitor, MonitorError, RemoteEngine, StopOutcome};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{apply_env_overrides, config_path, load_config, ConsoleConfig};
use crate::render::{
    format_accounts, format_log_line, format_status_table, format_summary, LogFilter, ViewDiff,
};
use crate::wallets::WalletFileSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "fleet-console")]
#[command(about = "Drive and watch a batch run on the automation engine", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a batch over every registered wallet and follow it until idle
    Run {
        /// Only print log lines of these severities (info, success, error)
        #[arg(long, value_delimiter = ',')]
        show: Vec<Severity>,
    },
    /// Print the engine's current per-account results
    Status {
        /// Only list accounts in this state (running, success, failed)
        #[arg(long)]
        only: Option<TaskStatus>,
    },
    /// Ask the engine to stop the current batch
    Stop,
    /// List registered wallets
    Accounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    let path = config_path(cli.config.as_deref());
    let mut config = load_config(&path)?;
    apply_env_overrides(&mut config);
    info!(
        event = "config_loaded",
        path = %path.display(),
        socket = %config.engine.socket_path.display(),
        wallets = %config.wallets_path.display()
    );

    match cli.command {
        Commands::Run { show } => run(config, LogFilter::new(show)).await,
        Commands::Status { only } => status(config, only).await,
        Commands::Stop => stop(config).await,
        Commands::Accounts => accounts(&config),
    }
}

async fn connect(config: &ConsoleConfig) -> Result<EngineClient> {
    let client = EngineClient::spawn(config.engine.clone());
    client
        .wait_connected(CONNECT_TIMEOUT)
        .await
        .context("automation engine is not reachable")?;
    Ok(client)
}

async fn run(config: ConsoleConfig, filter: LogFilter) -> Result<()> {
    let client = connect(&config).await?;
    let source = WalletFileSource::new(&config.wallets_path);
    let (handle, task) = Monitor::spawn(config.monitor.clone(), Arc::new(source), Arc::new(client));

    let entities = handle.load().await.context("failed to load wallets")?;
    println!("loaded {} wallets", entities.len());

    let mut view_rx = handle.watch_view();
    let mut log_rx = handle.subscribe_log();
    let epoch = match handle.start(config.start.clone()).await {
        Ok(epoch) => epoch,
        Err(MonitorError::NoEntities) => {
            println!("no wallets registered in {}", config.wallets_path.display());
            handle.shutdown().await;
            return Ok(());
        }
        Err(err) => {
            handle.shutdown().await;
            return Err(err).context("engine refused to start the batch");
        }
    };

    let (stop_tx, mut stop_rx) = mpsc::channel::<Result<StopOutcome, MonitorError>>(1);
    let mut stop_requested = false;
    let mut diff = ViewDiff::new();

    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                for line in diff.changes(&view) {
                    println!("{line}");
                }
                if view.is_idle() && view.epoch == epoch {
                    break;
                }
            }
            entry = log_rx.recv() => match entry {
                Ok(entry) if filter.allows(&entry) => println!("{}", format_log_line(&entry)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => println!("... {skipped} log lines skipped"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                println!("stopping...");
                let handle = handle.clone();
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    let _ = stop_tx.send(handle.stop().await).await;
                });
            }
            Some(outcome) = stop_rx.recv() => report_stop(outcome),
        }
    }

    drain_logs(&mut log_rx, &filter);
    if let Ok(outcome) = stop_rx.try_recv() {
        report_stop(outcome);
    }
    let view = handle.view().await?;
    println!("{}", format_summary(&view));
    handle.shutdown().await;
    if let Err(err) = task.await {
        warn!(event = "monitor_join_failed", error = %err);
    }
    Ok(())
}

fn drain_logs(
    log_rx: &mut tokio::sync::broadcast::Receiver<fleet_core::LogEntry>,
    filter: &LogFilter,
) {
    while let Ok(entry) = log_rx.try_recv() {
        if filter.allows(&entry) {
            println!("{}", format_log_line(&entry));
        }
    }
}

fn report_stop(outcome: Result<StopOutcome, MonitorError>) {
    match outcome {
        Ok(StopOutcome::Confirmed) => println!("engine confirmed stop"),
        Ok(StopOutcome::TimedOut) => println!("engine did not confirm stop in time"),
        Ok(StopOutcome::AlreadyIdle) | Ok(StopOutcome::RunAborted) => {}
        Err(err) => println!("stop failed: {err}"),
    }
}

async fn status(config: ConsoleConfig, only: Option<TaskStatus>) -> Result<()> {
    let client = connect(&config).await?;
    let snapshot = client
        .poll_status(0)
        .await
        .context("status request failed")?;
    let entities = match WalletFileSource::new(&config.wallets_path).read() {
        Ok(entities) => entities,
        Err(err) => {
            warn!(event = "wallets_unreadable", error = %err);
            Vec::new()
        }
    };
    println!("{}", format_status_table(&snapshot, &entities, only));
    Ok(())
}

async fn stop(config: ConsoleConfig) -> Result<()> {
    let client = connect(&config).await?;
    client
        .request_stop()
        .await
        .context("stop request failed")?;
    println!("stop requested");
    Ok(())
}

fn accounts(config: &ConsoleConfig) -> Result<()> {
    let entities = WalletFileSource::new(&config.wallets_path)
        .read()
        .with_context(|| format!("failed to read {}", config.wallets_path.display()))?;
    println!("{}", format_accounts(&entities));
    Ok(())
}
