//! Workload and execution records
//!
//! A [`Workload`] is the user-owned identity; an [`Execution`] is the current
//! attempt to run it. The two travel together as an [`ExecutionRecord`], which
//! is exactly what the execution store persists per workload.

use crate::runtime::backend::BackendKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Uploaded,
    Running,
    Crashed,
    Stopped,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Uploaded => "Uploaded",
            ExecutionState::Running => "Running",
            ExecutionState::Crashed => "Crashed",
            ExecutionState::Stopped => "Stopped",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Uploaded, Running)
                | (Running, Crashed)
                | (Running, Stopped)
                | (Crashed, Running)
                | (Crashed, Stopped)
                | (Stopped, Running)
                | (Uploaded, Stopped)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Uploaded" => Ok(ExecutionState::Uploaded),
            "Running" => Ok(ExecutionState::Running),
            "Crashed" => Ok(ExecutionState::Crashed),
            "Stopped" => Ok(ExecutionState::Stopped),
            other => Err(format!("unknown execution state '{}'", other)),
        }
    }
}

/// Reference to a running instance inside a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendHandle {
    Process { pid: u32 },
    Container { container_id: String },
}

impl BackendHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendHandle::Process { .. } => BackendKind::Process,
            BackendHandle::Container { .. } => BackendKind::Container,
        }
    }

    /// Split into the (kind, value) columns used by the store
    pub(crate) fn to_columns(&self) -> (&'static str, String) {
        match self {
            BackendHandle::Process { pid } => ("process", pid.to_string()),
            BackendHandle::Container { container_id } => ("container", container_id.clone()),
        }
    }

    pub(crate) fn from_columns(kind: Option<&str>, value: Option<&str>) -> Option<Self> {
        match (kind?, value?) {
            ("process", pid) => pid.parse().ok().map(|pid| BackendHandle::Process { pid }),
            ("container", id) => Some(BackendHandle::Container {
                container_id: id.to_string(),
            }),
            _ => None,
        }
    }
}

/// Last observed resource usage
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU usage in percent of one core
    pub cpu_percent: f64,

    /// Resident memory in MiB
    pub ram_mb: f64,
}

/// User-owned unit of executable code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub workload_id: String,
    pub owner_id: String,
    pub display_name: String,

    /// Opaque reference handed to the artifact resolver
    pub artifact_reference: String,

    pub auto_restart: bool,
}

impl Workload {
    pub fn new(
        workload_id: impl Into<String>,
        owner_id: impl Into<String>,
        display_name: impl Into<String>,
        artifact_reference: impl Into<String>,
    ) -> Self {
        Self {
            workload_id: workload_id.into(),
            owner_id: owner_id.into(),
            display_name: display_name.into(),
            artifact_reference: artifact_reference.into(),
            auto_restart: false,
        }
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }
}

/// One attempt to run a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Same as the workload id
    pub execution_id: String,
    pub backend_handle: Option<BackendHandle>,
    pub state: ExecutionState,
    pub started_at: Option<DateTime<Utc>>,
    pub cpu_sample: Option<f64>,
    pub ram_sample: Option<f64>,
}

impl Execution {
    /// Fresh execution of a just uploaded workload
    pub fn uploaded(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            backend_handle: None,
            state: ExecutionState::Uploaded,
            started_at: None,
            cpu_sample: None,
            ram_sample: None,
        }
    }

    /// Execution that a backend has just started
    pub fn running(execution_id: impl Into<String>, handle: BackendHandle) -> Self {
        Self {
            execution_id: execution_id.into(),
            backend_handle: Some(handle),
            state: ExecutionState::Running,
            started_at: Some(Utc::now()),
            cpu_sample: None,
            ram_sample: None,
        }
    }

    /// Check the handle/state coupling
    pub fn is_consistent(&self) -> bool {
        match self.state {
            ExecutionState::Running => self.backend_handle.is_some(),
            ExecutionState::Uploaded | ExecutionState::Stopped => self.backend_handle.is_none(),
            ExecutionState::Crashed => true,
        }
    }
}

/// A workload together with its current execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub workload: Workload,
    pub execution: Execution,
}

impl ExecutionRecord {
    pub fn workload_id(&self) -> &str {
        &self.workload.workload_id
    }

    pub fn state(&self) -> ExecutionState {
        self.execution.state
    }

    pub fn handle(&self) -> Option<&BackendHandle> {
        self.execution.backend_handle.as_ref()
    }
}

/// Change of the handle column in a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum HandleUpdate {
    Keep,
    Clear,
    Set(BackendHandle),
}

/// Fields written by a conditional update
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state: ExecutionState,
    pub handle: HandleUpdate,

    /// When set, the stored handle must also still be this one
    pub expected_handle: Option<BackendHandle>,
}

impl StateUpdate {
    /// Mark crashed and keep the last handle for diagnostics
    pub fn crashed() -> Self {
        Self {
            state: ExecutionState::Crashed,
            handle: HandleUpdate::Keep,
            expected_handle: None,
        }
    }

    /// Mark stopped and release the handle
    pub fn stopped() -> Self {
        Self {
            state: ExecutionState::Stopped,
            handle: HandleUpdate::Clear,
            expected_handle: None,
        }
    }

    /// Only apply while the row still carries `handle`
    ///
    /// Guards against a row that left and re-entered the expected state with
    /// a different instance in between.
    pub fn if_handle(mut self, handle: Option<&BackendHandle>) -> Self {
        self.expected_handle = handle.cloned();
        self
    }
}
