//! Worker daemon entry point (SPEC_FULL.md §6).
//!
//! Connects to the durable store and drives a [`WorkerPool`] until
//! SIGTERM/SIGINT. Tool resolution uses the in-memory reference
//! registry shipped by `orchestrator-core`; a production deployment is
//! expected to supply an HTTP-backed `ToolRegistry` in its place.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::pipeline::{InMemoryToolRegistry, PipelineExecutor};
use orchestrator_core::store::PostgresTaskStore;
use orchestrator_core::worker::{WorkerPool, WorkerPoolConfig};
use orchestrator_core::{CoreConfig, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let core_config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker configuration");
            return ExitCode::from(1);
        }
    };
    let worker_config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker configuration");
            return ExitCode::from(1);
        }
    };

    match run(core_config, worker_config).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "worker exited with an unrecoverable error");
            ExitCode::from(2)
        }
    }
}

async fn run(core_config: CoreConfig, worker_config: WorkerConfig) -> Result<()> {
    tracing::info!(worker_id = %core_config.worker_id, "orchestrator-worker starting");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&core_config.database_url)
        .await
        .context("failed to connect to the store")?;
    let store = Arc::new(PostgresTaskStore::new(pool));
    store.migrate().await.context("failed to run store migrations")?;

    let registry = Arc::new(InMemoryToolRegistry::with_reference_tools());
    let executor = Arc::new(PipelineExecutor::new(registry));

    let pool_config = WorkerPoolConfig::default()
        .with_worker_id(core_config.worker_id.clone())
        .with_max_concurrency(worker_config.max_concurrency)
        .with_lease_duration(core_config.lease_duration())
        .with_poll_interval_min(worker_config.poll_interval);

    let worker_pool = Arc::new(WorkerPool::new(store, executor, pool_config));
    worker_pool.start().await.context("failed to start worker pool")?;

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining worker pool");
    worker_pool.shutdown().await.context("worker pool shutdown failed")?;

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
