//! Allow-listed dependency installation
//!
//! Owners submit `pip install <package>` lines. Each line is checked against
//! the configured allow-list and then run on its own, bounded by the install
//! timeout of the resource limits.

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::config::InstallSettings;
use crate::utils::errors::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Characters of stderr kept for a failed install
const STDERR_EXCERPT: usize = 200;

/// Result of one install line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallOutcome {
    Installed,
    Rejected,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub command: String,
    pub outcome: InstallOutcome,
}

/// Runs allow-listed `pip install` commands
pub struct PackageInstaller {
    pip_bin: String,
    allowed: BTreeSet<String>,
    timeout: Duration,
}

impl PackageInstaller {
    pub fn new(settings: &InstallSettings, limits: &ResourceLimits) -> Self {
        Self {
            pip_bin: settings.pip_bin.clone(),
            allowed: settings
                .allowed_packages
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            timeout: limits.install_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate a command line and return the requirement to install
    ///
    /// Only `pip install <requirement>` with a single requirement whose
    /// package name, without version or extras, is allow-listed. The
    /// requirement is limited to a name, optional extras and version
    /// specifiers; direct references (`name @ url`), paths and options are
    /// rejected because pip would fetch them from wherever they point.
    pub fn validate(&self, line: &str) -> Result<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let requirement = match parts.as_slice() {
            ["pip", "install", requirement] => *requirement,
            _ => return Err(SupervisorError::InstallRejected(line.trim().to_string())),
        };

        if !is_plain_requirement(requirement) {
            warn!("Blocked install of requirement {:?}", requirement);
            return Err(SupervisorError::InstallRejected(requirement.to_string()));
        }

        let package = package_name(requirement);
        if package.is_empty() || !self.allowed.contains(&package.to_lowercase()) {
            warn!("Blocked install of package {:?}", package);
            return Err(SupervisorError::InstallRejected(package.to_string()));
        }
        Ok(requirement.to_string())
    }

    /// Validate and run a single line
    #[instrument(skip(self))]
    pub async fn install(&self, line: &str) -> InstallOutcome {
        let requirement = match self.validate(line) {
            Ok(requirement) => requirement,
            Err(_) => return InstallOutcome::Rejected,
        };

        match self.run_pip(&requirement).await {
            Ok(outcome) => outcome,
            Err(SupervisorError::InstallTimeout(after)) => {
                warn!("Install of {} timed out after {:?}", requirement, after);
                InstallOutcome::TimedOut
            }
            Err(e) => InstallOutcome::Failed(e.to_string()),
        }
    }

    /// Run every non-blank line in order
    pub async fn install_all(&self, commands: &str) -> Vec<InstallReport> {
        let mut reports = Vec::new();
        for line in commands.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let outcome = self.install(line).await;
            reports.push(InstallReport {
                command: line.to_string(),
                outcome,
            });
        }
        reports
    }

    async fn run_pip(&self, requirement: &str) -> Result<InstallOutcome> {
        let child = Command::new(&self.pip_bin)
            .arg("install")
            .arg(requirement)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::ConfigError(format!("cannot run {}: {}", self.pip_bin, e))
            })?;

        // Dropping the future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SupervisorError::InstallTimeout(self.timeout))?
            .map_err(|e| SupervisorError::ConfigError(format!("install failed: {}", e)))?;

        if output.status.success() {
            info!("Installed {}", requirement);
            Ok(InstallOutcome::Installed)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(InstallOutcome::Failed(
                stderr.trim().chars().take(STDERR_EXCERPT).collect(),
            ))
        }
    }
}

/// Name, extras and version specifiers only: `requests[socks]>=2.0,<3`
fn is_plain_requirement(requirement: &str) -> bool {
    !requirement.starts_with('-')
        && requirement.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '[' | ']' | ',' | '=' | '<' | '>' | '!' | '~' | '*')
        })
}

/// Package name of a requirement such as `requests[socks]>=2.0`
fn package_name(requirement: &str) -> &str {
    let end = requirement
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';'))
        .unwrap_or(requirement.len());
    requirement[..end].trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer(pip_bin: &str) -> PackageInstaller {
        let settings = InstallSettings {
            pip_bin: pip_bin.to_string(),
            ..InstallSettings::default()
        };
        PackageInstaller::new(&settings, &ResourceLimits::default())
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("requests"), "requests");
        assert_eq!(package_name("requests==2.31.0"), "requests");
        assert_eq!(package_name("flask>=2"), "flask");
        assert_eq!(package_name("requests[socks]"), "requests");
        assert_eq!(package_name("==1.0"), "");
    }

    #[test]
    fn test_plain_requirement() {
        assert!(is_plain_requirement("requests"));
        assert!(is_plain_requirement("requests[socks,security]>=2.0,!=2.1.*"));
        assert!(is_plain_requirement("numpy~=1.26"));

        assert!(!is_plain_requirement("requests@https://evil.example/requests.whl"));
        assert!(!is_plain_requirement("requests@git+https://evil.example/requests"));
        assert!(!is_plain_requirement("./requests"));
        assert!(!is_plain_requirement("-e"));
        assert!(!is_plain_requirement("requests;python_version<'4'"));
    }

    #[test]
    fn test_validate() {
        let installer = installer("pip");
        assert_eq!(installer.validate("pip install requests").unwrap(), "requests");
        assert_eq!(
            installer.validate("  pip install numpy==1.26.0 ").unwrap(),
            "numpy==1.26.0"
        );
        assert_eq!(
            installer.validate("pip install pytelegrambotapi").unwrap(),
            "pytelegrambotapi"
        );

        assert!(matches!(
            installer.validate("pip install evil-package"),
            Err(SupervisorError::InstallRejected(_))
        ));
        assert!(installer.validate("pip install").is_err());
        assert!(installer.validate("rm -rf /").is_err());
        assert!(installer
            .validate("pip install requests --index-url http://mirror")
            .is_err());

        // An allow-listed name must not smuggle in a download location
        for line in [
            "pip install requests@https://evil.example/requests-9.9-py3-none-any.whl",
            "pip install requests@file:///tmp/requests.whl",
            "pip install https://evil.example/requests.tar.gz",
            "pip install --pre",
        ] {
            assert!(
                matches!(installer.validate(line), Err(SupervisorError::InstallRejected(_))),
                "accepted {}",
                line
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_outcomes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pip = dir.path().join("pip");
        std::fs::write(
            &pip,
            "#!/bin/sh\ncase \"$2\" in\n  requests) exit 0 ;;\n  numpy) echo 'no matching distribution' >&2; exit 1 ;;\n  *) sleep 5 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&pip, std::fs::Permissions::from_mode(0o755)).unwrap();

        let installer = installer(pip.to_str().unwrap()).with_timeout(Duration::from_millis(300));
        let reports = installer
            .install_all("pip install requests\n\npip install numpy\npip install pandas\npip install torch\n")
            .await;

        let outcomes: Vec<_> = reports.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                InstallOutcome::Installed,
                InstallOutcome::Failed("no matching distribution".to_string()),
                InstallOutcome::TimedOut,
                InstallOutcome::Rejected,
            ]
        );
        assert_eq!(reports[0].command, "pip install requests");
    }
}
