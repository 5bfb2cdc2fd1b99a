//! Workload Supervisor Library
//!
//! Launches untrusted, user-supplied artifacts under resource limits, tracks
//! their liveness and restarts them after a crash.
//!
//! # Architecture
//!
//! - **runtime**: isolation backends, runner, supervisor, installer
//! - **store**: durable execution records with conditional updates
//! - **observability**: tracing subscriber and Prometheus metrics
//! - **utils**: configuration and error types

pub mod observability;
pub mod runtime;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use runtime::runner::{LaunchRequest, Runner};
pub use runtime::supervisor::{Supervisor, SweepReport};
pub use store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore};
pub use utils::config::SupervisorConfig;
pub use utils::errors::{Result, SupervisorError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
