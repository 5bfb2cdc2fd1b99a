//! Launching and stopping workloads
//!
//! The runner is the only place that starts or stops instances on a backend.
//! A launch is split in two steps:
//!
//! 1. [`Runner::launch`] checks the owner's quota, resolves the artifact and
//!    starts the instance. Nothing is written to the store.
//! 2. [`Runner::commit`] persists the started instance with one conditional
//!    write that re-checks the prior state and the quota inside the store. If
//!    that write is refused the fresh instance is stopped again.
//!
//! User deploys and supervisor restarts both go through this pair, so the
//! quota applies to both paths. Relaunching a `Crashed` workload first stops
//! the crashed instance: a dead process leader can leave its group behind and
//! a container can outlive a failed inspect.

use crate::observability::{LAUNCHES_TOTAL, RESTARTS_TOTAL, STOPS_TOTAL};
use crate::runtime::artifact::ArtifactResolver;
use crate::runtime::backend::{IsolationBackend, LaunchSpec};
use crate::runtime::events::StatusSink;
use crate::runtime::execution::{
    BackendHandle, Execution, ExecutionRecord, ExecutionState, StateUpdate, Workload,
};
use crate::runtime::resource_limiter::PolicySource;
use crate::store::ExecutionStore;
use crate::utils::errors::{Result, SupervisorError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Attempts before a stop gives up on a record that keeps changing under it
const STOP_ATTEMPTS: usize = 5;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Identity of the workload to launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub owner_id: String,
    pub workload_id: String,
    pub artifact_reference: String,
    pub auto_restart: bool,
}

impl From<&Workload> for LaunchRequest {
    fn from(workload: &Workload) -> Self {
        Self {
            owner_id: workload.owner_id.clone(),
            workload_id: workload.workload_id.clone(),
            artifact_reference: workload.artifact_reference.clone(),
            auto_restart: workload.auto_restart,
        }
    }
}

/// Starts, persists and stops workload executions
pub struct Runner {
    backend: Arc<dyn IsolationBackend>,
    store: Arc<dyn ExecutionStore>,
    policy: Arc<dyn PolicySource>,
    resolver: Arc<dyn ArtifactResolver>,
    events: StatusSink,
    stop_grace: Duration,
}

impl Runner {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        store: Arc<dyn ExecutionStore>,
        policy: Arc<dyn PolicySource>,
        resolver: Arc<dyn ArtifactResolver>,
    ) -> Self {
        Self {
            backend,
            store,
            policy,
            resolver,
            events: StatusSink::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Publish transitions on an existing sink
    pub fn with_events(mut self, events: StatusSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn events(&self) -> &StatusSink {
        &self.events
    }

    /// Register an uploaded workload
    pub fn register(&self, workload: &Workload) -> Result<ExecutionRecord> {
        let record = self.store.insert(workload)?;
        info!(
            "Registered workload {} for owner {}",
            workload.workload_id, workload.owner_id
        );
        Ok(record)
    }

    /// Toggle automatic restarts after a crash
    pub fn set_auto_restart(&self, workload_id: &str, auto_restart: bool) -> Result<()> {
        if self.store.set_auto_restart(workload_id, auto_restart)? {
            Ok(())
        } else {
            Err(SupervisorError::NotFound(workload_id.to_string()))
        }
    }

    /// Start an instance of the workload without persisting it
    #[instrument(skip(self, request), fields(workload_id = %request.workload_id, owner_id = %request.owner_id))]
    pub async fn launch(&self, request: &LaunchRequest) -> Result<Execution> {
        let backend = self.backend.kind().as_str();

        let limit = self.policy.max_concurrent(&request.owner_id);
        let running = self.store.count_running(&request.owner_id)?;
        if running >= limit {
            metrics::counter!(LAUNCHES_TOTAL, "backend" => backend, "outcome" => "quota_exceeded")
                .increment(1);
            return Err(SupervisorError::QuotaExceeded {
                owner_id: request.owner_id.clone(),
                limit,
            });
        }

        let Some(artifact) = self.resolver.resolve(&request.artifact_reference) else {
            metrics::counter!(LAUNCHES_TOTAL, "backend" => backend, "outcome" => "artifact_missing")
                .increment(1);
            return Err(SupervisorError::ArtifactMissing {
                workload_id: request.workload_id.clone(),
                reference: request.artifact_reference.clone(),
            });
        };

        let spec = LaunchSpec {
            workload_id: request.workload_id.clone(),
            owner_id: request.owner_id.clone(),
            artifact,
        };

        match self.backend.start(&spec, self.policy.limits()).await {
            Ok(handle) => {
                metrics::counter!(LAUNCHES_TOTAL, "backend" => backend, "outcome" => "started")
                    .increment(1);
                debug!("Started workload {} on {} backend", request.workload_id, backend);
                Ok(Execution::running(&request.workload_id, handle))
            }
            Err(cause) => {
                metrics::counter!(LAUNCHES_TOTAL, "backend" => backend, "outcome" => "failed")
                    .increment(1);
                Err(SupervisorError::LaunchFailure {
                    workload_id: request.workload_id.clone(),
                    backend: self.backend.kind(),
                    cause,
                })
            }
        }
    }

    /// Persist a launched execution if the workload is still in `expected`
    /// with `expected_handle`, when one is given
    ///
    /// On refusal the launched instance is stopped and the reason is returned
    /// as `QuotaExceeded` or `StateConflict`.
    #[instrument(skip(self, execution, expected_handle), fields(workload_id = %execution.execution_id))]
    pub async fn commit(
        &self,
        owner_id: &str,
        execution: Execution,
        expected: ExecutionState,
        expected_handle: Option<&BackendHandle>,
    ) -> Result<Execution> {
        let workload_id = execution.execution_id.clone();
        let limit = self.policy.max_concurrent(owner_id);

        let committed = match self.store.cas_launch(
            &workload_id,
            expected,
            expected_handle,
            &execution,
            limit,
        ) {
            Ok(committed) => committed,
            Err(e) => {
                self.discard(&workload_id, execution.backend_handle.as_ref()).await;
                return Err(e);
            }
        };

        if committed {
            self.events.emit(&workload_id, expected, ExecutionState::Running);
            info!("Workload {} is running", workload_id);
            return Ok(execution);
        }

        self.discard(&workload_id, execution.backend_handle.as_ref()).await;

        match self.store.get(&workload_id)? {
            None => Err(SupervisorError::NotFound(workload_id)),
            Some(record)
                if record.state() != expected
                    || expected_handle.is_some_and(|h| record.handle() != Some(h)) =>
            {
                Err(SupervisorError::StateConflict {
                    workload_id,
                    expected,
                })
            }
            Some(_) => Err(SupervisorError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                limit,
            }),
        }
    }

    /// Stop an instance that was started but could not be persisted
    async fn discard(&self, workload_id: &str, handle: Option<&BackendHandle>) {
        let Some(handle) = handle else {
            return;
        };
        if !self.backend.stop(handle, self.stop_grace).await {
            warn!("{}", self.stop_failure(workload_id));
        }
    }

    fn stop_failure(&self, workload_id: &str) -> SupervisorError {
        SupervisorError::StopFailure {
            workload_id: workload_id.to_string(),
            backend: self.backend.kind(),
        }
    }

    /// Stop what is left of a crashed instance before it is replaced
    ///
    /// Fails with `StopFailure` when the backend cannot confirm, so the
    /// record stays `Crashed` instead of running two instances.
    async fn clear_crashed(&self, record: &ExecutionRecord) -> Result<()> {
        let Some(handle) = record.handle() else {
            return Ok(());
        };
        if self.backend.stop(handle, self.stop_grace).await {
            debug!("Cleared crashed instance of {}", record.workload_id());
            Ok(())
        } else {
            Err(self.stop_failure(record.workload_id()))
        }
    }

    /// Clear a crashed instance, then launch and commit against `record`
    async fn relaunch(&self, record: &ExecutionRecord) -> Result<Execution> {
        if record.state() == ExecutionState::Crashed {
            self.clear_crashed(record).await?;
        }
        let execution = self.launch(&LaunchRequest::from(&record.workload)).await?;
        self.commit(
            &record.workload.owner_id,
            execution,
            record.state(),
            record.handle(),
        )
        .await
    }

    /// User-triggered launch of a registered workload
    #[instrument(skip(self))]
    pub async fn deploy(&self, workload_id: &str) -> Result<Execution> {
        let record = self
            .store
            .get(workload_id)?
            .ok_or_else(|| SupervisorError::NotFound(workload_id.to_string()))?;

        if record.state() == ExecutionState::Running {
            return Err(SupervisorError::AlreadyRunning(workload_id.to_string()));
        }

        self.relaunch(&record).await
    }

    /// Supervisor-triggered relaunch of a crashed workload
    ///
    /// `record` is the `Crashed` row as read; the relaunch only lands if the
    /// row still holds that state and handle.
    #[instrument(skip(self, record), fields(workload_id = %record.workload_id()))]
    pub async fn restart(&self, record: &ExecutionRecord) -> Result<Execution> {
        let result = if record.state() == ExecutionState::Crashed {
            self.relaunch(record).await
        } else {
            Err(SupervisorError::StateConflict {
                workload_id: record.workload_id().to_string(),
                expected: ExecutionState::Crashed,
            })
        };

        let outcome = if result.is_ok() { "restarted" } else { "failed" };
        metrics::counter!(RESTARTS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    /// Stop a workload and mark it `Stopped`
    ///
    /// The record ends up `Stopped` even when the backend cannot confirm
    /// termination. The returned flag is that confirmation, `true` when there
    /// was nothing to stop.
    ///
    /// Each attempt re-reads the row, stops a handle not stopped yet and
    /// writes `Stopped` pinned to that state and handle. A write only loses
    /// when another writer changed the row in between, so after
    /// `STOP_ATTEMPTS` lost writes the stop gives up with `StateConflict` and
    /// leaves the retry to the caller.
    #[instrument(skip(self))]
    pub async fn stop(&self, workload_id: &str) -> Result<bool> {
        let mut stopped_handle: Option<BackendHandle> = None;
        let mut confirmed = true;

        for _ in 0..STOP_ATTEMPTS {
            let record = self
                .store
                .get(workload_id)?
                .ok_or_else(|| SupervisorError::NotFound(workload_id.to_string()))?;

            if record.state() == ExecutionState::Stopped {
                return Ok(confirmed);
            }

            // A restart may have swapped the handle since the last attempt
            if let Some(handle) = record.handle() {
                if stopped_handle.as_ref() != Some(handle) {
                    confirmed = self.backend.stop(handle, self.stop_grace).await;
                    if !confirmed {
                        warn!("{}", self.stop_failure(workload_id));
                    }
                    stopped_handle = Some(handle.clone());
                }
            }

            let update = StateUpdate::stopped().if_handle(record.handle());
            if self.store.cas_update(workload_id, record.state(), &update)? {
                self.events
                    .emit(workload_id, record.state(), ExecutionState::Stopped);
                let label = if confirmed { "true" } else { "false" };
                metrics::counter!(STOPS_TOTAL, "confirmed" => label).increment(1);
                info!("Workload {} stopped", workload_id);
                return Ok(confirmed);
            }

            debug!("Workload {} changed during stop, retrying", workload_id);
        }

        Err(SupervisorError::StateConflict {
            workload_id: workload_id.to_string(),
            expected: ExecutionState::Stopped,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::runtime::backend::testing::FakeBackend;
    use crate::runtime::execution::ResourceSample;
    use crate::runtime::resource_limiter::{ResourceLimits, StaticPolicy};
    use crate::store::MemoryExecutionStore;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Resolves every reference except the ones starting with `missing`
    pub struct AnyResolver;

    impl ArtifactResolver for AnyResolver {
        fn resolve(&self, reference: &str) -> Option<PathBuf> {
            if reference.starts_with("missing") {
                None
            } else {
                Some(PathBuf::from(reference))
            }
        }
    }

    /// Memory store whose conditional updates can be made to lose or fail
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: MemoryExecutionStore,
        /// Every `cas_update` reports a lost race
        pub lose_updates: AtomicBool,
        /// `cas_update` on these workloads fails with a storage error
        pub fail_updates_for: Mutex<HashSet<String>>,
        pub fail_restartable: AtomicBool,
    }

    fn storage_error(operation: &str) -> SupervisorError {
        SupervisorError::StorageFailed(format!("{} unavailable", operation))
    }

    impl ExecutionStore for FlakyStore {
        fn insert(&self, workload: &Workload) -> Result<ExecutionRecord> {
            self.inner.insert(workload)
        }

        fn get(&self, workload_id: &str) -> Result<Option<ExecutionRecord>> {
            self.inner.get(workload_id)
        }

        fn get_running(&self) -> Result<Vec<ExecutionRecord>> {
            self.inner.get_running()
        }

        fn get_restartable(&self) -> Result<Vec<ExecutionRecord>> {
            if self.fail_restartable.load(Ordering::SeqCst) {
                return Err(storage_error("get_restartable"));
            }
            self.inner.get_restartable()
        }

        fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>> {
            self.inner.list_for_owner(owner_id)
        }

        fn count_running(&self, owner_id: &str) -> Result<usize> {
            self.inner.count_running(owner_id)
        }

        fn cas_update(
            &self,
            workload_id: &str,
            expected: ExecutionState,
            update: &StateUpdate,
        ) -> Result<bool> {
            if self.fail_updates_for.lock().contains(workload_id) {
                return Err(storage_error("cas_update"));
            }
            if self.lose_updates.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.cas_update(workload_id, expected, update)
        }

        fn cas_launch(
            &self,
            workload_id: &str,
            expected: ExecutionState,
            expected_handle: Option<&BackendHandle>,
            execution: &Execution,
            max_running: usize,
        ) -> Result<bool> {
            self.inner
                .cas_launch(workload_id, expected, expected_handle, execution, max_running)
        }

        fn set_auto_restart(&self, workload_id: &str, auto_restart: bool) -> Result<bool> {
            self.inner.set_auto_restart(workload_id, auto_restart)
        }

        fn record_sample(&self, workload_id: &str, sample: &ResourceSample) -> Result<()> {
            self.inner.record_sample(workload_id, sample)
        }
    }

    pub fn runner_with_store(
        max_concurrent: usize,
        store: Arc<dyn ExecutionStore>,
    ) -> (Runner, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new());
        let limits = ResourceLimits {
            max_concurrent,
            ..ResourceLimits::default()
        };
        let runner = Runner::new(
            backend.clone(),
            store,
            Arc::new(StaticPolicy::new(limits)),
            Arc::new(AnyResolver),
        )
        .with_stop_grace(Duration::from_millis(10));
        (runner, backend)
    }

    pub fn runner(max_concurrent: usize) -> (Runner, Arc<FakeBackend>, Arc<MemoryExecutionStore>) {
        let store = Arc::new(MemoryExecutionStore::new());
        let (runner, backend) = runner_with_store(max_concurrent, store.clone());
        (runner, backend, store)
    }
}
