//! Resource limits for user workloads
//!
//! Provides the static policy every launch is bounded by:
//! - CPU usage (percentage of one core)
//! - Memory consumption (MB limit)
//! - Concurrent workloads per owner
//! - CPU time of a bare process and wall clock of an install command
//!
//! Per-owner concurrency comes from a [`PolicySource`] so that entitlements
//! issued elsewhere can raise or lower it without touching global limits.

use crate::utils::errors::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resource limits applied to every workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU quota as percentage of one core
    /// Example: 50 = half a core
    pub max_cpu_percent: u32,

    /// Memory ceiling in megabytes
    pub max_ram_mb: u64,

    /// Workloads one owner may have running at the same time
    pub max_concurrent: usize,

    /// CPU seconds a bare process may consume (RLIMIT_CPU)
    pub cpu_time_secs: u64,

    /// Wall clock allowed for one dependency install command
    pub install_timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 50,
            max_ram_mb: 200,
            max_concurrent: 3,
            cpu_time_secs: 30,
            install_timeout_secs: 60,
        }
    }
}

impl ResourceLimits {
    /// Create strict limits (for untrusted code)
    pub fn strict() -> Self {
        Self {
            max_cpu_percent: 25,
            max_ram_mb: 128,
            max_concurrent: 1,
            cpu_time_secs: 10,
            install_timeout_secs: 30,
        }
    }

    /// Create relaxed limits (for development)
    pub fn relaxed() -> Self {
        Self {
            max_cpu_percent: 100,
            max_ram_mb: 2048,
            max_concurrent: 10,
            cpu_time_secs: 3600,
            install_timeout_secs: 300,
        }
    }

    /// Memory ceiling in bytes
    pub fn max_ram_bytes(&self) -> u64 {
        self.max_ram_mb * 1024 * 1024
    }

    /// CFS quota for a 100ms period
    pub fn cpu_quota_us(&self) -> u64 {
        self.max_cpu_percent as u64 * 1000
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<()> {
        if self.max_cpu_percent == 0 {
            return Err(invalid("CPU quota cannot be 0"));
        }
        if self.max_cpu_percent > 400 {
            return Err(invalid("CPU quota cannot exceed 400% (4 cores)"));
        }

        // Interpreters need some headroom below this
        if self.max_ram_mb < 16 {
            return Err(invalid("Memory limit cannot be less than 16MB"));
        }
        if self.max_ram_mb > 16384 {
            return Err(invalid("Memory limit cannot exceed 16GB"));
        }

        if self.max_concurrent == 0 {
            return Err(invalid("Concurrent workload limit cannot be 0"));
        }
        if self.cpu_time_secs == 0 {
            return Err(invalid("CPU time limit cannot be 0"));
        }
        if self.install_timeout_secs == 0 {
            return Err(invalid("Install timeout cannot be 0"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> SupervisorError {
    SupervisorError::InvalidLimits(msg.to_string())
}

/// Source of per-owner quota and global caps
pub trait PolicySource: Send + Sync {
    /// Running workloads allowed for this owner
    fn max_concurrent(&self, owner_id: &str) -> usize;

    /// Global caps applied to every workload
    fn limits(&self) -> &ResourceLimits;
}

/// Policy backed by static limits plus per-owner overrides
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    limits: ResourceLimits,
    owner_overrides: HashMap<String, usize>,
}

impl StaticPolicy {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            owner_overrides: HashMap::new(),
        }
    }

    /// Override the concurrency limit of one owner
    pub fn with_owner_limit(mut self, owner_id: impl Into<String>, max_concurrent: usize) -> Self {
        self.owner_overrides.insert(owner_id.into(), max_concurrent);
        self
    }
}

impl PolicySource for StaticPolicy {
    fn max_concurrent(&self, owner_id: &str) -> usize {
        self.owner_overrides
            .get(owner_id)
            .copied()
            .unwrap_or(self.limits.max_concurrent)
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}
