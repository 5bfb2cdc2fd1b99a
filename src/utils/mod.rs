//! Shared utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::SupervisorConfig;
pub use errors::{BackendError, Result, SupervisorError};
