//! Process backend
//!
//! Starts artifacts as bare child processes. Supports several artifact types:
//! - Python (python3)
//! - Node.js (node)
//! - Shell scripts (sh)
//! - Native executables (run directly)
//!
//! Every child runs in its own session, so the whole process group can be
//! signalled on stop. A stop is only confirmed once no live member of the
//! group is left, and a pid that does not lead a group is never signalled. CPU-time and address-space rlimits are installed in the
//! child before the program's code runs. Both are best-effort: where the
//! platform lacks them the backend logs a warning and launches anyway.

use crate::runtime::backend::{BackendKind, IsolationBackend, LaunchSpec};
use crate::runtime::execution::{BackendHandle, ResourceSample};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::BackendError;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long a fresh child is watched for an immediate exit
const STARTUP_CHECK: Duration = Duration::from_millis(200);

/// Poll period while waiting for a signalled group to disappear
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Wait after SIGKILL before giving up on confirmation
const KILL_CONFIRM: Duration = Duration::from_secs(1);

/// Supported artifact types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    Python,
    NodeJs,
    Shell,
    Native,
}

impl ProcessType {
    /// Derive the artifact type from its file extension
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") => ProcessType::Python,
            Some("js") | Some("mjs") => ProcessType::NodeJs,
            Some("sh") => ProcessType::Shell,
            _ => ProcessType::Native,
        }
    }

    /// Interpreter for this type, `None` for native executables
    pub fn command(&self) -> Option<&'static str> {
        match self {
            ProcessType::Python => Some("python3"),
            ProcessType::NodeJs => Some("node"),
            ProcessType::Shell => Some("sh"),
            ProcessType::Native => None,
        }
    }

    /// Interpreter arguments placed before the artifact path
    pub fn default_args(&self) -> Vec<&'static str> {
        match self {
            ProcessType::Python => vec!["-u"], // Unbuffered output for the log file
            _ => vec![],
        }
    }
}

/// Backend running workloads as bare processes
pub struct ProcessBackend {
    /// Paths to interpreters (cached)
    executable_paths: Mutex<HashMap<ProcessType, PathBuf>>,

    /// Upper bound for one start
    startup_timeout: Duration,
}

impl ProcessBackend {
    pub fn new(startup_timeout: Duration) -> Self {
        if !rlimits_supported() {
            warn!("Resource limits are not supported on this platform, processes run uncapped");
        }

        Self {
            executable_paths: Mutex::new(HashMap::new()),
            startup_timeout,
        }
    }

    /// Find the interpreter for a process type
    fn find_executable(&self, process_type: ProcessType, command: &str) -> Result<PathBuf, BackendError> {
        if let Some(path) = self.executable_paths.lock().get(&process_type) {
            return Ok(path.clone());
        }

        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                self.executable_paths.lock().insert(process_type, path.clone());
                Ok(path)
            }
            Err(e) => Err(BackendError::Spawn(format!(
                "Executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    fn build_command(&self, spec: &LaunchSpec, limits: &ResourceLimits) -> Result<Command, BackendError> {
        let process_type = ProcessType::from_path(&spec.artifact);

        let mut command = match process_type.command() {
            Some(interpreter) => {
                let mut command = Command::new(self.find_executable(process_type, interpreter)?);
                command.args(process_type.default_args());
                command.arg(&spec.artifact);
                command
            }
            None => Command::new(&spec.artifact),
        };

        if let Some(dir) = spec.artifact.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let (stdout, stderr) = log_stdio(&spec.artifact);
        command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

        install_pre_exec(&mut command, limits);
        Ok(command)
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn start(
        &self,
        spec: &LaunchSpec,
        limits: &ResourceLimits,
    ) -> Result<BackendHandle, BackendError> {
        let mut command = self.build_command(spec, limits)?;

        debug!("Spawning process for workload {}", spec.workload_id);
        let mut child = command
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("Failed to spawn process: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| BackendError::Spawn("Process exited before reporting a pid".into()))?;

        // A child that dies right away never counts as started
        let check = STARTUP_CHECK.min(self.startup_timeout);
        match tokio::time::timeout(check, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(BackendError::Spawn(format!(
                    "Process exited during startup with {}",
                    status
                )));
            }
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {}
        }

        // Reap the child when it exits so a dead workload never lingers as a
        // zombie that still answers the liveness probe
        let workload_id = spec.workload_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Workload {} process exited with {}", workload_id, status),
                Err(e) => warn!("Failed to reap workload {} process: {}", workload_id, e),
            }
        });

        info!("Workload {} started as process group {}", spec.workload_id, pid);
        Ok(BackendHandle::Process { pid })
    }

    async fn is_live(&self, handle: &BackendHandle) -> Result<bool, BackendError> {
        match handle {
            BackendHandle::Process { pid } => Ok(pid_exists(*pid)),
            BackendHandle::Container { .. } => Ok(false),
        }
    }

    async fn stop(&self, handle: &BackendHandle, grace: Duration) -> bool {
        let pid = match handle {
            BackendHandle::Process { pid } => *pid,
            BackendHandle::Container { .. } => {
                warn!("Process backend cannot stop a container handle");
                return false;
            }
        };

        if !group_exists(pid) {
            return true;
        }

        // Interrupt, then terminate, then kill
        let half = grace / 2;
        let escalation = [
            (Signal::SIGINT, half),
            (Signal::SIGTERM, grace.saturating_sub(half)),
            (Signal::SIGKILL, KILL_CONFIRM),
        ];

        for (signal, wait) in escalation {
            debug!("Sending {} to process group {}", signal, pid);
            if !signal_group(pid, signal) {
                return true;
            }
            if wait_for_exit(pid, wait).await {
                return true;
            }
        }

        !group_exists(pid)
    }

    async fn sample(&self, handle: &BackendHandle) -> Option<ResourceSample> {
        match handle {
            BackendHandle::Process { pid } => sample_proc(*pid),
            BackendHandle::Container { .. } => None,
        }
    }
}

/// Zero-cost existence check, no signal is delivered
fn pid_exists(pid: u32) -> bool {
    // pid 0 and negative values address process groups, never a workload
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true, // Exists, owned by someone else
        Err(_) => false,
    }
}

/// Whether a live process is left in group `pgid`
///
/// Zombies do not count: orphaned members are reaped by init, not by us.
fn group_exists(pgid: u32) -> bool {
    if pgid == 0 || pgid > i32::MAX as u32 {
        return false;
    }

    match killpg(Pid::from_raw(pgid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => group_has_live_member(pgid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn group_has_live_member(pgid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .any(|stat| {
            matches!(parse_group_state(&stat), Some((state, group)) if group == pgid && state != 'Z')
        })
}

#[cfg(not(target_os = "linux"))]
fn group_has_live_member(_pgid: u32) -> bool {
    true
}

/// Process state and process group from `/proc/<pid>/stat`
fn parse_group_state(content: &str) -> Option<(char, u32)> {
    let rest = &content[content.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Signal the group led by `pid`, false when there is no such group
///
/// A pid that leads no group was not started by this backend, or was reused
/// after the workload exited, so it is left alone.
fn signal_group(pid: u32, signal: Signal) -> bool {
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            debug!("Process group {} is gone", pgid);
            false
        }
        Err(e) => {
            warn!("Failed to send {} to process group {}: {}", signal, pgid, e);
            true
        }
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !group_exists(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// Append stdout and stderr to `<artifact>.log`, discard if not writable
fn log_stdio(artifact: &Path) -> (Stdio, Stdio) {
    let log_path = artifact.with_extension("log");
    if log_path == artifact {
        return (Stdio::null(), Stdio::null());
    }

    let file = OpenOptions::new().create(true).append(true).open(&log_path);
    match file.and_then(|f| f.try_clone().map(|clone| (f, clone))) {
        Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
        Err(e) => {
            debug!("Workload output discarded, cannot open {:?}: {}", log_path, e);
            (Stdio::null(), Stdio::null())
        }
    }
}

#[cfg(unix)]
fn rlimits_supported() -> bool {
    use nix::sys::resource::{getrlimit, Resource};
    getrlimit(Resource::RLIMIT_CPU).is_ok()
}

#[cfg(not(unix))]
fn rlimits_supported() -> bool {
    false
}

/// New session plus CPU-time and address-space caps, set in the child
#[cfg(unix)]
fn install_pre_exec(command: &mut Command, limits: &ResourceLimits) {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    // A child cannot raise its hard limit, so never ask for more than the host allows
    let mut cpu_secs = limits.cpu_time_secs;
    match getrlimit(Resource::RLIMIT_CPU) {
        Ok((_, hard)) if hard < cpu_secs => {
            warn!("Host CPU-time hard limit {} is below the requested {}s", hard, cpu_secs);
            cpu_secs = hard;
        }
        Ok(_) => {}
        Err(e) => warn!("CPU-time limit unavailable, launching uncapped: {}", e),
    }

    let mut mem_bytes = limits.max_ram_bytes();
    #[cfg(target_os = "linux")]
    {
        if let Ok((_, hard)) = getrlimit(Resource::RLIMIT_AS) {
            if hard < mem_bytes {
                warn!("Host address-space hard limit {} is below the requested {} bytes", hard, mem_bytes);
                mem_bytes = hard;
            }
        }
    }

    // SAFETY: only async-signal-safe syscalls run between fork and exec
    unsafe {
        command.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;

            // The host may refuse these; the parent has already logged that
            let _ = setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs);
            #[cfg(target_os = "linux")]
            let _ = setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes);
            #[cfg(not(target_os = "linux"))]
            let _ = mem_bytes;

            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn install_pre_exec(_command: &mut Command, _limits: &ResourceLimits) {
    warn!("Process groups and resource limits not supported on this platform");
}

/// Fields of `/proc/<pid>/stat` after the command name
/// Returns (utime, stime, starttime) in clock ticks
fn parse_proc_stat(content: &str) -> Option<(u64, u64, u64)> {
    // The command name may contain spaces and parentheses
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    let starttime = fields.get(19)?.parse().ok()?;
    Some((utime, stime, starttime))
}

#[cfg(target_os = "linux")]
fn sample_proc(pid: u32) -> Option<ResourceSample> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;

    let (utime, stime, starttime) = parse_proc_stat(&stat)?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let uptime_secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;

    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ticks <= 0 || page_size <= 0 {
        return None;
    }
    let ticks = ticks as f64;

    let elapsed = uptime_secs - starttime as f64 / ticks;
    let cpu_secs = (utime + stime) as f64 / ticks;
    let cpu_percent = if elapsed > 0.0 {
        (cpu_secs / elapsed * 100.0).max(0.0)
    } else {
        0.0
    };

    Some(ResourceSample {
        cpu_percent,
        ram_mb: (resident_pages * page_size as u64) as f64 / (1024.0 * 1024.0),
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_proc(_pid: u32) -> Option<ResourceSample> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec_for(path: PathBuf) -> LaunchSpec {
        LaunchSpec {
            workload_id: "wl-test".into(),
            owner_id: "owner".into(),
            artifact: path,
        }
    }

    #[test]
    fn test_process_type_from_path() {
        assert_eq!(ProcessType::from_path(Path::new("bot.py")), ProcessType::Python);
        assert_eq!(ProcessType::from_path(Path::new("bot.js")), ProcessType::NodeJs);
        assert_eq!(ProcessType::from_path(Path::new("run.sh")), ProcessType::Shell);
        assert_eq!(ProcessType::from_path(Path::new("server")), ProcessType::Native);
    }

    #[test]
    fn test_process_type_command() {
        assert_eq!(ProcessType::Python.command(), Some("python3"));
        assert_eq!(ProcessType::NodeJs.command(), Some("node"));
        assert_eq!(ProcessType::Shell.command(), Some("sh"));
        assert_eq!(ProcessType::Native.command(), None);
        assert_eq!(ProcessType::Python.default_args(), vec!["-u"]);
    }

    #[test]
    fn test_parse_proc_stat() {
        let stat = "1234 (my (odd) bot) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    250 50 0 0 20 0 1 0 9000 1000000 200 18446744073709551615";
        assert_eq!(parse_proc_stat(stat), Some((250, 50, 9000)));
        assert_eq!(parse_proc_stat("garbage"), None);
    }

    #[test]
    fn test_unknown_pids_are_not_live() {
        assert!(!pid_exists(0));
        assert!(!pid_exists(999_999_999));
        assert!(pid_exists(std::process::id()));
        assert!(!group_exists(0));
        assert!(!group_exists(999_999_999));
    }

    #[test]
    fn test_parse_group_state() {
        let stat = "1234 (my (odd) bot) S 1 4321 4321 0 -1 4194560";
        assert_eq!(parse_group_state(stat), Some(('S', 4321)));
        assert_eq!(parse_group_state("77 (sh) Z 1 70 70"), Some(('Z', 70)));
        assert_eq!(parse_group_state("garbage"), None);
    }

    #[tokio::test]
    async fn test_container_handle_is_foreign() {
        let backend = ProcessBackend::new(Duration::from_secs(5));
        let handle = BackendHandle::Container {
            container_id: "abc".into(),
        };
        assert!(!backend.is_live(&handle).await.unwrap());
        assert!(!backend.stop(&handle, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_stop_gone_process_is_idempotent() {
        let backend = ProcessBackend::new(Duration::from_secs(5));
        let handle = BackendHandle::Process { pid: 999_999_999 };
        assert!(backend.stop(&handle, Duration::from_millis(10)).await);
        assert!(backend.stop(&handle, Duration::from_millis(10)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_probe_stop() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let backend = ProcessBackend::new(Duration::from_secs(5));
        let handle = backend
            .start(&spec_for(script), &ResourceLimits::default())
            .await
            .unwrap();

        assert!(matches!(handle, BackendHandle::Process { .. }));
        assert!(backend.is_live(&handle).await.unwrap());

        assert!(backend.stop(&handle, Duration::from_secs(2)).await);
        assert!(!backend.is_live(&handle).await.unwrap());

        // Second stop on the same handle still succeeds
        assert!(backend.stop(&handle, Duration::from_secs(2)).await);

        // Output was redirected next to the artifact
        assert!(dir.path().join("worker.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_reaches_background_children() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("spawner.sh");
        std::fs::write(&script, "sleep 300 &\nwait\n").unwrap();

        let backend = ProcessBackend::new(Duration::from_secs(5));
        let handle = backend
            .start(&spec_for(script), &ResourceLimits::default())
            .await
            .unwrap();
        let BackendHandle::Process { pid } = handle else {
            panic!("expected a process handle");
        };
        assert!(group_exists(pid));

        assert!(backend.stop(&handle, Duration::from_millis(400)).await);
        assert!(!group_exists(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_leaves_foreign_pid_alone() {
        // Shares this test's process group, so its pid leads no group
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let handle = BackendHandle::Process { pid: child.id() };

        let backend = ProcessBackend::new(Duration::from_secs(5));
        assert!(backend.stop(&handle, Duration::from_millis(100)).await);
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_missing_native_artifact_fails() {
        let dir = tempdir().unwrap();
        let backend = ProcessBackend::new(Duration::from_secs(5));
        let result = backend
            .start(&spec_for(dir.path().join("nope")), &ResourceLimits::default())
            .await;
        assert!(matches!(result, Err(BackendError::Spawn(_))));
    }
}
