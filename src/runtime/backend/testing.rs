//! In-memory backend for unit tests

use crate::runtime::backend::{BackendKind, IsolationBackend, LaunchSpec};
use crate::runtime::execution::{BackendHandle, ResourceSample};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Backend whose "processes" are entries in a set
#[derive(Default)]
pub(crate) struct FakeBackend {
    live: Mutex<HashSet<u32>>,
    next_pid: AtomicU32,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_probe: AtomicBool,
    pub stop_unconfirmed: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    /// Simulate an out-of-band kill
    pub fn kill(&self, handle: &BackendHandle) {
        if let BackendHandle::Process { pid } = handle {
            self.live.lock().remove(pid);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn start(
        &self,
        _spec: &LaunchSpec,
        _limits: &ResourceLimits,
    ) -> Result<BackendHandle, BackendError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BackendError::Spawn("interpreter crashed".into()));
        }
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(pid);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(BackendHandle::Process { pid })
    }

    async fn is_live(&self, handle: &BackendHandle) -> Result<bool, BackendError> {
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("probe failed".into()));
        }
        match handle {
            BackendHandle::Process { pid } => Ok(self.live.lock().contains(pid)),
            BackendHandle::Container { .. } => Ok(false),
        }
    }

    async fn stop(&self, handle: &BackendHandle, _grace: Duration) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.kill(handle);
        !self.stop_unconfirmed.load(Ordering::SeqCst)
    }

    async fn sample(&self, _handle: &BackendHandle) -> Option<ResourceSample> {
        Some(ResourceSample {
            cpu_percent: 1.5,
            ram_mb: 32.0,
        })
    }
}
