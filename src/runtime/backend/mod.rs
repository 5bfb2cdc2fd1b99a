//! Isolation backends
//!
//! An [`IsolationBackend`] knows how to start, probe, stop and sample one
//! running instance of an artifact:
//!
//! - **Process**: a child process in its own process group with best-effort
//!   rlimits applied before the program runs
//! - **Container**: an ephemeral, auto-removed container with explicit memory
//!   and CPU ceilings and a read-only mount of the artifact directory
//!
//! Which backend is used is decided once at startup by [`select_backend`] and
//! never changes per workload.

pub mod container;
pub mod process;

#[cfg(test)]
pub(crate) mod testing;

use crate::runtime::execution::{BackendHandle, ResourceSample};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::config::BackendSettings;
use crate::utils::errors::{BackendError, Result, SupervisorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use container::ContainerBackend;
pub use process::ProcessBackend;

/// Kind of isolation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Container,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Container => "container",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs to start one workload
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub workload_id: String,
    pub owner_id: String,

    /// Resolved artifact file
    pub artifact: PathBuf,
}

/// Capability interface shared by both backends
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the artifact under the given limits
    async fn start(
        &self,
        spec: &LaunchSpec,
        limits: &ResourceLimits,
    ) -> std::result::Result<BackendHandle, BackendError>;

    /// Non-blocking liveness probe
    ///
    /// Returns `Ok(false)` for handles whose process or container is already
    /// gone, and `Err` only when the probe itself could not be performed.
    async fn is_live(&self, handle: &BackendHandle) -> std::result::Result<bool, BackendError>;

    /// Terminate gracefully, escalating after `grace`
    ///
    /// Returns whether the target is confirmed gone. Stopping a handle that is
    /// already gone returns `true`.
    async fn stop(&self, handle: &BackendHandle, grace: Duration) -> bool;

    /// Current resource usage, if the backend can observe it
    async fn sample(&self, _handle: &BackendHandle) -> Option<ResourceSample> {
        None
    }
}

/// Pick the backend for this process
///
/// The container backend is used only when enabled and the container runtime
/// answers its health probe. With `require_container` a failed probe is an
/// error instead of a fallback to bare processes.
pub async fn select_backend(
    settings: &BackendSettings,
    startup_timeout: Duration,
) -> Result<Arc<dyn IsolationBackend>> {
    if settings.prefer_container || settings.require_container {
        let container = ContainerBackend::new(settings.clone(), startup_timeout);
        match container.health_probe().await {
            Ok(version) => {
                info!("Container runtime {} available, using container backend", version);
                return Ok(Arc::new(container));
            }
            Err(e) if settings.require_container => {
                return Err(SupervisorError::ConfigError(format!(
                    "container backend required but unavailable: {}",
                    e
                )));
            }
            Err(e) => {
                warn!("Container runtime unavailable ({}), falling back to process backend", e);
            }
        }
    } else {
        info!("Container backend disabled, using process backend");
    }

    Ok(Arc::new(ProcessBackend::new(startup_timeout)))
}
