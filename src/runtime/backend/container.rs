//! Container backend
//!
//! Runs each workload in an ephemeral container through the container runtime
//! CLI. Containers are started detached with `--rm`, an explicit memory
//! ceiling, a CFS CPU quota and only the artifact's own directory mounted
//! read-only at `/app`. Every CLI call is bounded by a timeout so a hung
//! runtime degrades into probe errors instead of a stalled supervisor.

use crate::runtime::backend::process::ProcessType;
use crate::runtime::backend::{BackendKind, IsolationBackend, LaunchSpec};
use crate::runtime::execution::{BackendHandle, ResourceSample};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::config::BackendSettings;
use crate::utils::errors::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CPU_PERIOD_US: u64 = 100_000;
const MOUNT_POINT: &str = "/app";

/// Subset of `docker inspect` state
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,

    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
}

fn parse_state(stdout: &[u8]) -> Result<ContainerState, BackendError> {
    serde_json::from_slice(stdout)
        .map_err(|e| BackendError::Runtime(format!("unreadable container state: {}", e)))
}

/// Backend running workloads as containers
pub struct ContainerBackend {
    settings: BackendSettings,
    startup_timeout: Duration,
}

impl ContainerBackend {
    pub fn new(settings: BackendSettings, startup_timeout: Duration) -> Self {
        Self {
            settings,
            startup_timeout,
        }
    }

    /// Ask the runtime for its server version
    pub async fn health_probe(&self) -> Result<String, BackendError> {
        let output = self
            .docker(&["version", "--format", "{{.Server.Version}}"], self.settings.probe_timeout())
            .await?;
        if !output.status.success() {
            return Err(BackendError::Unavailable(stderr_of(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run one CLI call, killed when the timeout elapses
    async fn docker<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<Output, BackendError> {
        self.run_cli(args, timeout).await?.ok_or_else(|| {
            BackendError::Unavailable(format!(
                "container runtime did not answer within {:?}",
                timeout
            ))
        })
    }

    /// Like [`Self::docker`], `None` when the call timed out
    async fn run_cli<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Duration,
    ) -> Result<Option<Output>, BackendError> {
        let mut command = Command::new(&self.settings.docker_bin);
        command
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::Unavailable(
                format!("'{}' not found", self.settings.docker_bin),
            )),
            Ok(Err(e)) => Err(BackendError::Io(e)),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start(
        &self,
        spec: &LaunchSpec,
        limits: &ResourceLimits,
    ) -> Result<BackendHandle, BackendError> {
        let artifact = std::fs::canonicalize(&spec.artifact)?;
        let (dir, file_name) = match (artifact.parent(), artifact.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().to_string()),
            _ => {
                return Err(BackendError::Spawn(format!(
                    "artifact of workload {} has no parent directory",
                    spec.workload_id
                )))
            }
        };

        let name = container_name(&spec.workload_id);
        let args = run_args(spec, limits, &self.settings.image, &name, &dir, &file_name);

        debug!("Starting container {} for workload {}", name, spec.workload_id);
        let output = match self.run_cli(args.as_slice(), self.startup_timeout).await? {
            Some(output) => output,
            None => {
                // The runtime may have created the container before timing out
                let _ = self.docker(&["rm", "-f", name.as_str()], self.settings.probe_timeout()).await;
                return Err(BackendError::StartupTimeout(self.startup_timeout));
            }
        };

        if !output.status.success() {
            return Err(BackendError::Runtime(stderr_of(&output)));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(BackendError::Runtime("runtime returned no container id".into()));
        }

        info!("Workload {} started in container {}", spec.workload_id, name);
        Ok(BackendHandle::Container { container_id })
    }

    async fn is_live(&self, handle: &BackendHandle) -> Result<bool, BackendError> {
        let container_id = match handle {
            BackendHandle::Container { container_id } => container_id,
            BackendHandle::Process { .. } => return Ok(false),
        };

        let output = self
            .docker(
                &["inspect", "--format", "{{json .State}}", container_id.as_str()],
                self.settings.probe_timeout(),
            )
            .await?;

        if output.status.success() {
            let state = parse_state(&output.stdout)?;
            if state.oom_killed {
                warn!("Container exited after exceeding its memory limit");
            }
            return Ok(state.status == "running");
        }

        let stderr = stderr_of(&output);
        if is_missing(&stderr) {
            Ok(false)
        } else {
            Err(BackendError::Runtime(stderr))
        }
    }

    async fn stop(&self, handle: &BackendHandle, grace: Duration) -> bool {
        let container_id = match handle {
            BackendHandle::Container { container_id } => container_id,
            BackendHandle::Process { .. } => {
                warn!("Container backend cannot stop a process handle");
                return false;
            }
        };

        let grace_secs = grace.as_secs().max(1).to_string();
        let timeout = grace + self.settings.probe_timeout();
        let result = self
            .docker(&["stop", "-t", grace_secs.as_str(), container_id.as_str()], timeout)
            .await;

        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) if is_missing(&stderr_of(&output)) => true,
            Ok(output) => {
                warn!("Container stop failed: {}", stderr_of(&output));
                matches!(self.is_live(handle).await, Ok(false))
            }
            Err(e) => {
                warn!("Container stop failed: {}", e);
                false
            }
        }
    }

    async fn sample(&self, handle: &BackendHandle) -> Option<ResourceSample> {
        let BackendHandle::Container { container_id } = handle else {
            return None;
        };

        let output = self
            .docker(
                &[
                    "stats",
                    "--no-stream",
                    "--format",
                    "{{.CPUPerc}}|{{.MemUsage}}",
                    container_id.as_str(),
                ],
                self.settings.probe_timeout(),
            )
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        parse_stats(String::from_utf8_lossy(&output.stdout).trim())
    }
}

/// Unique, recognizable container name
fn container_name(workload_id: &str) -> String {
    let safe: String = workload_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("wl-{}-{}", safe, ulid::Ulid::new().to_string().to_lowercase())
}

fn run_args(
    spec: &LaunchSpec,
    limits: &ResourceLimits,
    image: &str,
    name: &str,
    dir: &Path,
    file_name: &str,
) -> Vec<String> {
    let memory = format!("{}m", limits.max_ram_mb);
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "--memory".into(),
        memory.clone(),
        "--memory-swap".into(),
        memory,
        "--cpu-period".into(),
        CPU_PERIOD_US.to_string(),
        "--cpu-quota".into(),
        limits.cpu_quota_us().to_string(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--label".into(),
        format!("workload-supervisor.workload={}", spec.workload_id),
        "--label".into(),
        format!("workload-supervisor.owner={}", spec.owner_id),
        "-v".into(),
        format!("{}:{}:ro", dir.display(), MOUNT_POINT),
        "-w".into(),
        MOUNT_POINT.into(),
        image.into(),
    ];

    let process_type = ProcessType::from_path(Path::new(file_name));
    if let Some(interpreter) = process_type.command() {
        args.push(interpreter.into());
        args.extend(process_type.default_args().into_iter().map(String::from));
    }
    args.push(format!("{}/{}", MOUNT_POINT, file_name));
    args
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such")
}

/// Parse `12.50%|45.2MiB / 200MiB`
fn parse_stats(line: &str) -> Option<ResourceSample> {
    let (cpu, mem) = line.split_once('|')?;
    let cpu_percent = cpu.trim().trim_end_matches('%').parse().ok()?;
    let used = mem.split('/').next()?.trim();
    Some(ResourceSample {
        cpu_percent,
        ram_mb: parse_size_mb(used)?,
    })
}

/// Parse a runtime-formatted size like `45.2MiB` or `1.5GB` into MiB
fn parse_size_mb(value: &str) -> Option<f64> {
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().ok()?;

    let bytes = match unit {
        "B" => number,
        "KiB" => number * 1024.0,
        "MiB" => number * 1024.0 * 1024.0,
        "GiB" => number * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => number * 1000.0,
        "MB" => number * 1000.0 * 1000.0,
        "GB" => number * 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some(bytes / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_state() {
        let state = parse_state(br#"{"Status":"exited","Running":false,"OOMKilled":true,"ExitCode":137}"#).unwrap();
        assert_eq!(state.status, "exited");
        assert!(state.oom_killed);

        let state = parse_state(b"{\"Status\":\"running\"}\n").unwrap();
        assert_eq!(state.status, "running");
        assert!(!state.oom_killed);

        assert!(matches!(parse_state(b"<no value>"), Err(BackendError::Runtime(_))));
    }

    fn missing_runtime() -> ContainerBackend {
        ContainerBackend::new(
            BackendSettings {
                docker_bin: "definitely-not-a-container-runtime".into(),
                ..Default::default()
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_run_args() {
        let spec = LaunchSpec {
            workload_id: "wl-7".into(),
            owner_id: "alice".into(),
            artifact: PathBuf::from("/srv/projects/bot.py"),
        };
        let args = run_args(
            &spec,
            &ResourceLimits::default(),
            "python:3.9-slim",
            "wl-wl-7-x",
            Path::new("/srv/projects"),
            "bot.py",
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --rm --name wl-wl-7-x"));
        assert!(joined.contains("--memory 200m"));
        assert!(joined.contains("--cpu-period 100000 --cpu-quota 50000"));
        assert!(joined.contains("-v /srv/projects:/app:ro"));
        assert!(joined.ends_with("python:3.9-slim python3 -u /app/bot.py"));
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let name = container_name("my bot/1");
        assert!(name.starts_with("wl-my_bot_1-"));
        assert!(!name.contains(' '));
    }

    #[test]
    fn test_parse_stats() {
        let sample = parse_stats("12.50%|45MiB / 200MiB").unwrap();
        assert!((sample.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert!((sample.ram_mb - 45.0).abs() < 1e-9);

        let sample = parse_stats("0.00%|1GiB / 2GiB").unwrap();
        assert!((sample.ram_mb - 1024.0).abs() < 1e-9);

        assert!(parse_stats("--").is_none());
        assert!(parse_size_mb("12XB").is_none());
    }

    #[test]
    fn test_missing_detection() {
        assert!(is_missing("Error: No such container: abc"));
        assert!(is_missing("Error: No such object: abc"));
        assert!(!is_missing("Cannot connect to the Docker daemon"));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_a_probe_error() {
        let backend = missing_runtime();
        assert!(matches!(
            backend.health_probe().await,
            Err(BackendError::Unavailable(_))
        ));

        let handle = BackendHandle::Container {
            container_id: "abc".into(),
        };
        assert!(backend.is_live(&handle).await.is_err());
        assert!(!backend.stop(&handle, Duration::from_millis(10)).await);
        assert!(backend.sample(&handle).await.is_none());
    }

    #[tokio::test]
    async fn test_process_handle_is_foreign() {
        let backend = missing_runtime();
        let handle = BackendHandle::Process { pid: 1 };
        assert!(!backend.is_live(&handle).await.unwrap());
    }
}
