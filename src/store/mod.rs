//! Execution persistence
//!
//! The store is the single shared resource between the supervisor loop and
//! request handling. Every state transition is a conditional write that only
//! succeeds if the stored state still matches what the writer read, so
//! concurrent writers never overwrite each other's transitions:
//!
//! ```text
//! Runner::commit ──┐
//! Runner::stop ────┼──► cas_update / cas_launch ──► row (state, handle)
//! Supervisor ──────┘    (WHERE state = expected [AND handle = expected])
//! ```
//!
//! Writers that act on a specific instance also pin its handle, so a row that
//! left the expected state and came back with a new instance is not mistaken
//! for the one they observed. Requests for a transition that is not an edge of
//! the lifecycle are refused with `StateConflict` before touching the row.
//!
//! - **SqliteExecutionStore**: durable store on a local SQLite file
//! - **MemoryExecutionStore**: process-local store for embedding and tests

pub mod sqlite;

use crate::runtime::execution::{
    BackendHandle, Execution, ExecutionRecord, ExecutionState, HandleUpdate, ResourceSample,
    StateUpdate, Workload,
};
use crate::utils::errors::{Result, SupervisorError};
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub use sqlite::SqliteExecutionStore;

/// Durable record of workloads and their executions
pub trait ExecutionStore: Send + Sync {
    /// Register a freshly uploaded workload
    fn insert(&self, workload: &Workload) -> Result<ExecutionRecord>;

    fn get(&self, workload_id: &str) -> Result<Option<ExecutionRecord>>;

    /// All records in state `Running`
    fn get_running(&self) -> Result<Vec<ExecutionRecord>>;

    /// `Crashed` records whose workload wants to be restarted
    fn get_restartable(&self) -> Result<Vec<ExecutionRecord>>;

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Running executions of one owner, recomputed on every call
    fn count_running(&self, owner_id: &str) -> Result<usize>;

    /// Apply `update` only if the stored state equals `expected` and, when
    /// `update.expected_handle` is set, the stored handle equals it
    fn cas_update(
        &self,
        workload_id: &str,
        expected: ExecutionState,
        update: &StateUpdate,
    ) -> Result<bool>;

    /// Persist a launched execution if the stored state equals `expected`,
    /// the stored handle equals `expected_handle` when one is given, and the
    /// owner runs fewer than `max_running` executions
    fn cas_launch(
        &self,
        workload_id: &str,
        expected: ExecutionState,
        expected_handle: Option<&BackendHandle>,
        execution: &Execution,
        max_running: usize,
    ) -> Result<bool>;

    fn set_auto_restart(&self, workload_id: &str, auto_restart: bool) -> Result<bool>;

    /// Remember the latest resource usage of a running execution
    fn record_sample(&self, workload_id: &str, sample: &ResourceSample) -> Result<()>;
}

/// Store keeping all records in process memory
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: Mutex<BTreeMap<String, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered(&self, keep: impl Fn(&ExecutionRecord) -> bool) -> Vec<ExecutionRecord> {
        self.records.lock().values().filter(|r| keep(r)).cloned().collect()
    }
}

/// Refuse a write that is not an edge of the lifecycle
pub(crate) fn check_transition(
    workload_id: &str,
    expected: ExecutionState,
    next: ExecutionState,
) -> Result<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(SupervisorError::StateConflict {
            workload_id: workload_id.to_string(),
            expected,
        })
    }
}

fn holds(execution: &Execution, expected: ExecutionState, handle: Option<&BackendHandle>) -> bool {
    execution.state == expected
        && handle.map_or(true, |h| execution.backend_handle.as_ref() == Some(h))
}

fn running_of(records: &BTreeMap<String, ExecutionRecord>, owner_id: &str) -> usize {
    records
        .values()
        .filter(|r| r.workload.owner_id == owner_id && r.state() == ExecutionState::Running)
        .count()
}

impl ExecutionStore for MemoryExecutionStore {
    fn insert(&self, workload: &Workload) -> Result<ExecutionRecord> {
        let mut records = self.records.lock();
        if records.contains_key(&workload.workload_id) {
            return Err(SupervisorError::StorageFailed(format!(
                "workload {} already exists",
                workload.workload_id
            )));
        }

        let record = ExecutionRecord {
            workload: workload.clone(),
            execution: Execution::uploaded(&workload.workload_id),
        };
        records.insert(workload.workload_id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, workload_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.lock().get(workload_id).cloned())
    }

    fn get_running(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.filtered(|r| r.state() == ExecutionState::Running))
    }

    fn get_restartable(&self) -> Result<Vec<ExecutionRecord>> {
        Ok(self.filtered(|r| r.state() == ExecutionState::Crashed && r.workload.auto_restart))
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>> {
        Ok(self.filtered(|r| r.workload.owner_id == owner_id))
    }

    fn count_running(&self, owner_id: &str) -> Result<usize> {
        Ok(running_of(&self.records.lock(), owner_id))
    }

    fn cas_update(
        &self,
        workload_id: &str,
        expected: ExecutionState,
        update: &StateUpdate,
    ) -> Result<bool> {
        check_transition(workload_id, expected, update.state)?;

        let mut records = self.records.lock();
        let Some(record) = records.get_mut(workload_id) else {
            return Ok(false);
        };
        if !holds(&record.execution, expected, update.expected_handle.as_ref()) {
            return Ok(false);
        }

        record.execution.state = update.state;
        match &update.handle {
            HandleUpdate::Keep => {}
            HandleUpdate::Clear => record.execution.backend_handle = None,
            HandleUpdate::Set(handle) => record.execution.backend_handle = Some(handle.clone()),
        }
        Ok(true)
    }

    fn cas_launch(
        &self,
        workload_id: &str,
        expected: ExecutionState,
        expected_handle: Option<&BackendHandle>,
        execution: &Execution,
        max_running: usize,
    ) -> Result<bool> {
        check_transition(workload_id, expected, ExecutionState::Running)?;

        let mut records = self.records.lock();
        let owner_id = match records.get(workload_id) {
            Some(record) if holds(&record.execution, expected, expected_handle) => {
                record.workload.owner_id.clone()
            }
            _ => return Ok(false),
        };
        if running_of(&records, &owner_id) >= max_running {
            return Ok(false);
        }

        if let Some(record) = records.get_mut(workload_id) {
            record.execution = Execution {
                execution_id: workload_id.to_string(),
                backend_handle: execution.backend_handle.clone(),
                state: ExecutionState::Running,
                started_at: execution.started_at,
                cpu_sample: None,
                ram_sample: None,
            };
        }
        Ok(true)
    }

    fn set_auto_restart(&self, workload_id: &str, auto_restart: bool) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(workload_id) {
            Some(record) => {
                record.workload.auto_restart = auto_restart;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_sample(&self, workload_id: &str, sample: &ResourceSample) -> Result<()> {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(workload_id) {
            if record.execution.state == ExecutionState::Running {
                record.execution.cpu_sample = Some(sample.cpu_percent);
                record.execution.ram_sample = Some(sample.ram_mb);
            }
        }
        Ok(())
    }
}

/// Behaviour every store implementation must share
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;

    fn running(id: &str, pid: u32) -> Execution {
        Execution::running(id, BackendHandle::Process { pid })
    }

    pub fn insert_and_get(store: &dyn ExecutionStore) {
        let workload = Workload::new("wl-1", "alice", "Echo bot", "echo.py").with_auto_restart(true);
        let record = store.insert(&workload).unwrap();
        assert_eq!(record.state(), ExecutionState::Uploaded);
        assert!(record.handle().is_none());

        let fetched = store.get("wl-1").unwrap().unwrap();
        assert_eq!(fetched.workload, workload);
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.insert(&workload).is_err());
    }

    pub fn cas_update_checks_state(store: &dyn ExecutionStore) {
        store.insert(&Workload::new("wl-1", "alice", "a", "a.py")).unwrap();
        assert!(store.cas_launch("wl-1", ExecutionState::Uploaded, None, &running("wl-1", 42), 3).unwrap());

        // Crash keeps the handle for diagnostics
        assert!(store.cas_update("wl-1", ExecutionState::Running, &StateUpdate::crashed()).unwrap());
        let record = store.get("wl-1").unwrap().unwrap();
        assert_eq!(record.state(), ExecutionState::Crashed);
        assert_eq!(record.handle(), Some(&BackendHandle::Process { pid: 42 }));

        // A stale writer expecting Running loses
        assert!(!store.cas_update("wl-1", ExecutionState::Running, &StateUpdate::stopped()).unwrap());

        assert!(store.cas_update("wl-1", ExecutionState::Crashed, &StateUpdate::stopped()).unwrap());
        let record = store.get("wl-1").unwrap().unwrap();
        assert_eq!(record.state(), ExecutionState::Stopped);
        assert!(record.handle().is_none());

        assert!(!store.cas_update("missing", ExecutionState::Running, &StateUpdate::crashed()).unwrap());
    }

    pub fn cas_refuses_non_edges(store: &dyn ExecutionStore) {
        store.insert(&Workload::new("wl-1", "alice", "a", "a.py")).unwrap();
        assert!(store.cas_update("wl-1", ExecutionState::Uploaded, &StateUpdate::stopped()).unwrap());

        // Stopped -> Crashed is not an edge, whatever the stored state is
        let err = store
            .cas_update("wl-1", ExecutionState::Stopped, &StateUpdate::crashed())
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::StateConflict { expected: ExecutionState::Stopped, .. }
        ));
        assert!(store
            .cas_update("wl-1", ExecutionState::Uploaded, &StateUpdate::crashed())
            .is_err());

        assert!(store.cas_launch("wl-1", ExecutionState::Stopped, None, &running("wl-1", 1), 3).unwrap());
        assert!(store
            .cas_launch("wl-1", ExecutionState::Running, None, &running("wl-1", 2), 3)
            .is_err());
        assert_eq!(store.get("wl-1").unwrap().unwrap().handle(), Some(&BackendHandle::Process { pid: 1 }));
    }

    pub fn cas_pins_handle(store: &dyn ExecutionStore) {
        store.insert(&Workload::new("wl-1", "alice", "a", "a.py")).unwrap();
        let first = BackendHandle::Process { pid: 1 };
        let second = BackendHandle::Process { pid: 2 };
        assert!(store.cas_launch("wl-1", ExecutionState::Uploaded, None, &running("wl-1", 1), 3).unwrap());

        // The row went Running(1) -> Stopped -> Running(2) behind a reader of pid 1
        assert!(store.cas_update("wl-1", ExecutionState::Running, &StateUpdate::stopped()).unwrap());
        assert!(store.cas_launch("wl-1", ExecutionState::Stopped, None, &running("wl-1", 2), 3).unwrap());

        let stale = StateUpdate::crashed().if_handle(Some(&first));
        assert!(!store.cas_update("wl-1", ExecutionState::Running, &stale).unwrap());
        assert_eq!(store.get("wl-1").unwrap().unwrap().state(), ExecutionState::Running);

        let current = StateUpdate::crashed().if_handle(Some(&second));
        assert!(store.cas_update("wl-1", ExecutionState::Running, &current).unwrap());

        // Relaunching from Crashed is pinned the same way
        assert!(!store
            .cas_launch("wl-1", ExecutionState::Crashed, Some(&first), &running("wl-1", 3), 3)
            .unwrap());
        assert!(store
            .cas_launch("wl-1", ExecutionState::Crashed, Some(&second), &running("wl-1", 3), 3)
            .unwrap());
        assert_eq!(store.get("wl-1").unwrap().unwrap().handle(), Some(&BackendHandle::Process { pid: 3 }));
    }

    pub fn cas_launch_enforces_quota(store: &dyn ExecutionStore) {
        for i in 0..3 {
            let id = format!("wl-{}", i);
            store.insert(&Workload::new(&id, "alice", "bot", "bot.py")).unwrap();
        }
        store.insert(&Workload::new("other", "bob", "bot", "bot.py")).unwrap();

        assert!(store.cas_launch("wl-0", ExecutionState::Uploaded, None, &running("wl-0", 1), 2).unwrap());
        assert!(store.cas_launch("wl-1", ExecutionState::Uploaded, None, &running("wl-1", 2), 2).unwrap());
        assert!(!store.cas_launch("wl-2", ExecutionState::Uploaded, None, &running("wl-2", 3), 2).unwrap());
        assert_eq!(store.count_running("alice").unwrap(), 2);

        // Other owners are unaffected
        assert!(store.cas_launch("other", ExecutionState::Uploaded, None, &running("other", 4), 2).unwrap());
        assert_eq!(store.count_running("bob").unwrap(), 1);

        // Wrong expected state
        assert!(!store.cas_launch("wl-0", ExecutionState::Crashed, None, &running("wl-0", 5), 10).unwrap());

        let running = store.get_running().unwrap();
        assert_eq!(running.len(), 3);
        assert_eq!(store.list_for_owner("alice").unwrap().len(), 3);
    }

    pub fn restartable_and_samples(store: &dyn ExecutionStore) {
        store
            .insert(&Workload::new("auto", "alice", "a", "a.py").with_auto_restart(true))
            .unwrap();
        store.insert(&Workload::new("manual", "alice", "m", "m.py")).unwrap();

        for (id, pid) in [("auto", 10), ("manual", 11)] {
            assert!(store.cas_launch(id, ExecutionState::Uploaded, None, &running(id, pid), 5).unwrap());
            store
                .record_sample(id, &ResourceSample { cpu_percent: 12.5, ram_mb: 64.0 })
                .unwrap();
            assert!(store.cas_update(id, ExecutionState::Running, &StateUpdate::crashed()).unwrap());
        }

        let restartable = store.get_restartable().unwrap();
        assert_eq!(restartable.len(), 1);
        assert_eq!(restartable[0].workload_id(), "auto");
        assert_eq!(restartable[0].execution.cpu_sample, Some(12.5));
        assert_eq!(restartable[0].execution.ram_sample, Some(64.0));

        assert!(store.set_auto_restart("manual", true).unwrap());
        assert_eq!(store.get_restartable().unwrap().len(), 2);
        assert!(!store.set_auto_restart("missing", true).unwrap());
    }
}
