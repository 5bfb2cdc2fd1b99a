//! Logging and metrics setup
//!
//! Metric names used across the crate live here so dashboards have a single
//! place to look them up.

use crate::utils::config::LogFormat;
use crate::utils::errors::{Result, SupervisorError};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Launch attempts, labelled by `backend` and `outcome`
pub const LAUNCHES_TOTAL: &str = "workload_launches_total";

/// Running executions found dead by the supervisor
pub const CRASHES_TOTAL: &str = "workload_crashes_total";

/// Supervisor-triggered restarts, labelled by `outcome`
pub const RESTARTS_TOTAL: &str = "workload_restarts_total";

/// Stops, labelled by whether the backend `confirmed` termination
pub const STOPS_TOTAL: &str = "workload_stops_total";

pub const PROBE_ERRORS_TOTAL: &str = "workload_probe_errors_total";

/// 1 while a sweep is in progress
pub const SWEEP_RUNNING: &str = "supervisor_sweep_running";

/// Install the global tracing subscriber
///
/// Honours `RUST_LOG`, falling back to `info`.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| SupervisorError::ConfigError(format!("tracing init failed: {}", e)))
}

/// Start the Prometheus scrape endpoint when an address is configured
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| SupervisorError::ConfigError(format!("invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SupervisorError::ConfigError(format!("metrics exporter failed: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
