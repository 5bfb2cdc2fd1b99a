//! Periodic liveness sweep
//!
//! The supervisor is a single tokio task. Every interval it probes all
//! `Running` executions, marks dead ones `Crashed` and relaunches crashed
//! workloads that asked for it. All of its writes are conditional on the state
//! and handle it just read (`Running` for a crash, `Crashed` for a restart),
//! so a user stop or redeploy racing a sweep always wins. A store error on one
//! record is logged and the sweep moves on to the next.

use crate::observability::{CRASHES_TOTAL, PROBE_ERRORS_TOTAL, SWEEP_RUNNING};
use crate::runtime::execution::{ExecutionRecord, ExecutionState, StateUpdate};
use crate::runtime::runner::Runner;
use crate::utils::config::SupervisorSettings;
use crate::utils::errors::{Result, SupervisorError};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// What a single sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running executions that were probed
    pub probed: usize,
    /// Executions marked crashed in this sweep
    pub crashed: usize,
    pub restarted: usize,
    pub restart_failed: usize,
    pub probe_errors: usize,
    /// Store operations that failed and were skipped
    pub store_errors: usize,
}

/// Background control loop over all running executions
pub struct Supervisor {
    runner: Arc<Runner>,
    interval: Duration,
    probe_failure_threshold: u32,

    /// Consecutive probe errors per workload
    probe_failures: DashMap<String, u32>,
}

enum Probe {
    Live,
    Dead,
    Inconclusive,
}

impl Supervisor {
    pub fn new(runner: Arc<Runner>, settings: &SupervisorSettings) -> Self {
        Self {
            runner,
            interval: settings.interval().max(MIN_INTERVAL),
            probe_failure_threshold: settings.probe_failure_threshold.max(1),
            probe_failures: DashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every running execution once, then restart crashed ones
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        metrics::gauge!(SWEEP_RUNNING).set(1.0);
        let result = self.sweep_inner().await;
        metrics::gauge!(SWEEP_RUNNING).set(0.0);
        result
    }

    async fn sweep_inner(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let store = self.runner.store();

        let running = store.get_running()?;
        let running_ids: HashSet<&str> = running.iter().map(|r| r.workload_id()).collect();
        self.probe_failures
            .retain(|id, _| running_ids.contains(id.as_str()));

        for record in &running {
            report.probed += 1;
            match self.probe(record, &mut report).await {
                Probe::Live => {}
                Probe::Inconclusive => {}
                Probe::Dead => {
                    self.probe_failures.remove(record.workload_id());
                    let update = StateUpdate::crashed().if_handle(record.handle());
                    let crashed =
                        match store.cas_update(record.workload_id(), ExecutionState::Running, &update) {
                            Ok(crashed) => crashed,
                            Err(e) => {
                                report.store_errors += 1;
                                warn!("Could not mark workload {} crashed: {}", record.workload_id(), e);
                                continue;
                            }
                        };
                    if crashed {
                        report.crashed += 1;
                        metrics::counter!(CRASHES_TOTAL).increment(1);
                        self.runner.events().emit(
                            record.workload_id(),
                            ExecutionState::Running,
                            ExecutionState::Crashed,
                        );
                        warn!("Workload {} crashed", record.workload_id());
                    } else {
                        debug!(
                            "Workload {} changed during probe, leaving it",
                            record.workload_id()
                        );
                    }
                }
            }
        }

        // Includes crashes left over from earlier sweeps whose restart failed
        let restartable = match store.get_restartable() {
            Ok(restartable) => restartable,
            Err(e) => {
                report.store_errors += 1;
                warn!("Skipping restarts this sweep: {}", e);
                return Ok(report);
            }
        };
        for record in restartable {
            match self.runner.restart(&record).await {
                Ok(_) => {
                    report.restarted += 1;
                    info!("Workload {} restarted", record.workload_id());
                }
                Err(e) => {
                    report.restart_failed += 1;
                    warn!("Restart of workload {} failed: {}", record.workload_id(), e);
                }
            }
        }

        Ok(report)
    }

    async fn probe(&self, record: &ExecutionRecord, report: &mut SweepReport) -> Probe {
        let backend = self.runner.backend();
        let Some(handle) = record.handle() else {
            warn!("Running workload {} has no backend handle", record.workload_id());
            return Probe::Dead;
        };

        match backend.is_live(handle).await {
            Ok(true) => {
                self.probe_failures.remove(record.workload_id());
                if let Some(sample) = backend.sample(handle).await {
                    if let Err(e) = self.runner.store().record_sample(record.workload_id(), &sample) {
                        debug!("Could not record sample for {}: {}", record.workload_id(), e);
                    }
                }
                Probe::Live
            }
            Ok(false) => Probe::Dead,
            Err(cause) => {
                report.probe_errors += 1;
                metrics::counter!(PROBE_ERRORS_TOTAL).increment(1);

                let failures = {
                    let mut entry = self
                        .probe_failures
                        .entry(record.workload_id().to_string())
                        .or_insert(0);
                    *entry += 1;
                    *entry
                };
                let err = SupervisorError::LivenessCheck {
                    workload_id: record.workload_id().to_string(),
                    backend: backend.kind(),
                    cause,
                };
                warn!("{} ({}/{})", err, failures, self.probe_failure_threshold);

                if failures >= self.probe_failure_threshold {
                    Probe::Dead
                } else {
                    Probe::Inconclusive
                }
            }
        }
    }

    /// Sweep at a fixed interval until `cancel` fires
    ///
    /// The first sweep runs immediately. Errors of a sweep are logged and the
    /// loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Supervisor started, sweeping every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) => debug!(?report, "Sweep finished"),
                Err(e) => error!("Sweep failed: {}", e),
            }
        }

        info!("Supervisor stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
