//! Workload Supervisor
//!
//! Daemon that keeps deployed workloads alive: it probes every running
//! execution at a fixed interval and restarts crashed ones.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workload_supervisor::observability::{init_metrics, init_tracing};
use workload_supervisor::runtime::{select_backend, DirectoryResolver, StaticPolicy};
use workload_supervisor::{Runner, SqliteExecutionStore, Supervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SupervisorConfig::load().context("failed to load configuration")?;

    init_tracing(config.observability.log_format)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting workload supervisor v{}", workload_supervisor::VERSION);
    info!("Configuration loaded: {:?}", config);

    let store = Arc::new(
        SqliteExecutionStore::open(&config.store.db_path).context("failed to open execution store")?,
    );
    let backend = select_backend(&config.backend, config.supervisor.startup_timeout()).await?;
    info!("Using {} backend", backend.kind());

    std::fs::create_dir_all(&config.artifacts.project_dir)
        .with_context(|| format!("cannot create {:?}", config.artifacts.project_dir))?;

    let runner = Runner::new(
        backend,
        store,
        Arc::new(StaticPolicy::new(config.limits.clone())),
        Arc::new(DirectoryResolver::new(&config.artifacts.project_dir)),
    )
    .with_stop_grace(config.supervisor.stop_grace());

    let supervisor = Arc::new(Supervisor::new(Arc::new(runner), &config.supervisor));
    let cancel = CancellationToken::new();
    let task = supervisor.spawn(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("Received shutdown signal, finishing current sweep...");

    cancel.cancel();
    task.await.context("supervisor task panicked")?;
    info!("Supervisor stopped gracefully");
    Ok(())
}
