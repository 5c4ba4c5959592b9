//! Scheduler daemon entry point (SPEC_FULL.md §6).
//!
//! Connects to the durable store, runs pending migrations, and drives
//! the cooperative [`Scheduler`] main loop until SIGTERM/SIGINT.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_core::scheduler::{ChangeMessage, EventMessage, Scheduler, SchedulerConfig};
use orchestrator_core::store::PostgresTaskStore;
use orchestrator_core::CoreConfig;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid scheduler configuration");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "scheduler exited with an unrecoverable error");
            ExitCode::from(2)
        }
    }
}

async fn run(config: CoreConfig) -> Result<()> {
    tracing::info!(worker_id = %config.worker_id, "orchestrator-scheduler starting");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the store")?;
    let store = Arc::new(PostgresTaskStore::new(pool));
    store.migrate().await.context("failed to run store migrations")?;

    let scheduler = Arc::new(Scheduler::new(
        store,
        SchedulerConfig::new(config.worker_id.clone()),
    ));

    // In-process stub for the change/event channels; SPEC_FULL.md §6
    // treats these as a trait seam a real message bus substitutes into.
    let (_change_tx, change_rx) = mpsc::channel::<ChangeMessage>(CHANGE_CHANNEL_CAPACITY);
    let (_event_tx, event_rx) = mpsc::channel::<EventMessage>(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_handle = tokio::spawn(scheduler.clone().run(change_rx, event_rx, shutdown_rx));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping scheduler");
    let _ = shutdown_tx.send(true);

    tokio::select! {
        result = run_handle => {
            result.context("scheduler task panicked")?;
        }
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            tracing::warn!("scheduler did not stop within the shutdown grace period");
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
