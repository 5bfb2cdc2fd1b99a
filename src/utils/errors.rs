//! Error types for the supervision core
//!
//! Everything that crosses the crate boundary is a [`SupervisorError`].
//! Backend-level failures are wrapped together with the workload id and the
//! backend kind, so callers can diagnose a failure without ever seeing the
//! raw pid or container id behind it.

use crate::runtime::backend::BackendKind;
use crate::runtime::execution::ExecutionState;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Failures raised by an isolation backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn workload: {0}")]
    Spawn(String),

    #[error("workload did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the supervision core
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("owner {owner_id} already runs the maximum of {limit} workloads")]
    QuotaExceeded { owner_id: String, limit: usize },

    #[error("artifact '{reference}' of workload {workload_id} does not exist")]
    ArtifactMissing {
        workload_id: String,
        reference: String,
    },

    #[error("launch of workload {workload_id} failed on {backend} backend: {cause}")]
    LaunchFailure {
        workload_id: String,
        backend: BackendKind,
        #[source]
        cause: BackendError,
    },

    #[error("liveness probe for workload {workload_id} failed on {backend} backend: {cause}")]
    LivenessCheck {
        workload_id: String,
        backend: BackendKind,
        #[source]
        cause: BackendError,
    },

    #[error("{backend} backend could not confirm that workload {workload_id} terminated")]
    StopFailure {
        workload_id: String,
        backend: BackendKind,
    },

    #[error("workload {0} is already running")]
    AlreadyRunning(String),

    #[error("workload {0} not found")]
    NotFound(String),

    #[error("workload {workload_id} is no longer {expected}")]
    StateConflict {
        workload_id: String,
        expected: ExecutionState,
    },

    #[error("invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("install command rejected: {0}")]
    InstallRejected(String),

    #[error("install command timed out after {0:?}")]
    InstallTimeout(Duration),

    #[error("storage failure: {0}")]
    StorageFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<rusqlite::Error> for SupervisorError {
    fn from(e: rusqlite::Error) -> Self {
        SupervisorError::StorageFailed(e.to_string())
    }
}

impl From<config::ConfigError> for SupervisorError {
    fn from(e: config::ConfigError) -> Self {
        SupervisorError::ConfigError(e.to_string())
    }
}

impl SupervisorError {
    /// Whether the caller can fix this error by changing its request
    pub fn is_caller_correctable(&self) -> bool {
        matches!(
            self,
            SupervisorError::QuotaExceeded { .. }
                | SupervisorError::ArtifactMissing { .. }
                | SupervisorError::AlreadyRunning(_)
                | SupervisorError::InstallRejected(_)
        )
    }
}
