//! Workload execution runtime
//!
//! This module launches untrusted artifacts under resource limits and keeps
//! them alive:
//!
//! - **Backend**: process and container isolation behind one trait
//! - **Runner**: quota-checked launch, commit and stop of executions
//! - **Supervisor**: periodic liveness sweep with crash detection and restart
//! - **Resource Limiter**: CPU, memory, concurrency and install time limits
//! - **Installer**: allow-listed dependency installation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  deploy/stop   ┌──────────┐  start/stop   ┌──────────────────┐
//! │   callers    │ ─────────────► │  Runner  │ ────────────► │ IsolationBackend │
//! └──────────────┘                └──────────┘               │ process|container│
//!                                   ▲     │ CAS              └──────────────────┘
//!                         restart   │     ▼                           ▲
//!                          ┌────────────┐  get_running   ┌────────────────┐
//!                          │ Supervisor │ ─────────────► │ ExecutionStore │
//!                          └────────────┘                └────────────────┘
//!                                 └──────────── is_live ──────────────┘
//! ```

pub mod artifact;
pub mod backend;
pub mod events;
pub mod execution;
pub mod installer;
pub mod resource_limiter;
pub mod runner;
pub mod supervisor;

// Re-export commonly used types
pub use artifact::{ArtifactResolver, DirectoryResolver};
pub use backend::{select_backend, BackendKind, IsolationBackend, LaunchSpec};
pub use events::{StatusEvent, StatusSink};
pub use execution::{BackendHandle, Execution, ExecutionRecord, ExecutionState, ResourceSample, Workload};
pub use installer::{InstallOutcome, InstallReport, PackageInstaller};
pub use resource_limiter::{PolicySource, ResourceLimits, StaticPolicy};
pub use runner::{LaunchRequest, Runner};
pub use supervisor::{Supervisor, SweepReport};
