//! Supervisor configuration
//!
//! Loaded from an optional `supervisor.{toml,yaml,json}` file in the working
//! directory, then overridden by `SUPERVISOR__<SECTION>__<KEY>` environment
//! variables. Every key has a default, so an empty environment is valid.

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub limits: ResourceLimits,
    pub supervisor: SupervisorSettings,
    pub backend: BackendSettings,
    pub store: StoreSettings,
    pub artifacts: ArtifactSettings,
    pub install: InstallSettings,
    pub observability: ObservabilitySettings,
}

impl SupervisorConfig {
    /// Load configuration from `supervisor.*` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("supervisor")
    }

    /// Load configuration from the given file stem and the environment
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let config: SupervisorConfig = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix("SUPERVISOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.limits.validate()?;
        Ok(config)
    }
}

/// Control loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Seconds between two sweeps
    pub interval_secs: u64,

    /// Consecutive probe errors before a workload counts as not live
    pub probe_failure_threshold: u32,

    /// Grace period granted to a workload on stop
    pub stop_grace_secs: u64,

    /// Upper bound for a backend start
    pub startup_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_failure_threshold: 3,
            stop_grace_secs: 5,
            startup_timeout_secs: 10,
        }
    }
}

impl SupervisorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Isolation backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Use the container backend when the runtime answers its health probe
    pub prefer_container: bool,

    /// Refuse to start when the container runtime is unavailable instead of
    /// falling back to bare processes
    pub require_container: bool,

    /// Image used for containerized workloads
    pub image: String,

    /// Container runtime CLI
    pub docker_bin: String,

    /// Upper bound for a single container runtime call
    pub probe_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            prefer_container: false,
            require_container: false,
            image: "python:3.9-slim".to_string(),
            docker_bin: "docker".to_string(),
            probe_timeout_ms: 2_000,
        }
    }
}

impl BackendSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Execution store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("supervisor.db"),
        }
    }
}

/// Artifact resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Directory all artifact references are resolved against
    pub project_dir: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("projects"),
        }
    }
}

/// Dependency installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    pub pip_bin: String,
    pub allowed_packages: BTreeSet<String>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            pip_bin: "pip".to_string(),
            allowed_packages: [
                "pyTelegramBotAPI",
                "requests",
                "beautifulsoup4",
                "flask",
                "django",
                "numpy",
                "pandas",
                "pillow",
                "matplotlib",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging and metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_format: LogFormat,

    /// Address of the Prometheus scrape endpoint, disabled when unset
    pub metrics_addr: Option<String>,
}
