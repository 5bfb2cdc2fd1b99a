//! Execution store on SQLite
//!
//! One row per workload. State transitions are single `UPDATE ... WHERE
//! workload_id = ? AND state = ?` statements whose affected-row count tells
//! the caller whether it won the race. A pinned handle adds
//! `AND (?k IS NULL OR (handle_kind = ?k AND handle_value = ?v))`.

use crate::runtime::execution::{
    BackendHandle, Execution, ExecutionRecord, ExecutionState, HandleUpdate, ResourceSample,
    StateUpdate, Workload,
};
use crate::store::{check_transition, ExecutionStore};
use crate::utils::errors::{Result, SupervisorError};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SELECT_COLUMNS: &str = "SELECT workload_id, owner_id, display_name, artifact_ref, auto_restart, \
     state, handle_kind, handle_value, started_at_ms, cpu_sample, ram_sample FROM executions";

/// SQLite-backed execution store
pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionStore {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            SupervisorError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        // WAL lets readers proceed while the supervisor writes
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(10))?;

        let store = Self::with_connection(conn)?;
        info!("Execution store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// Non-durable store, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                workload_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                artifact_ref TEXT NOT NULL,
                auto_restart INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                handle_kind TEXT NULL,
                handle_value TEXT NULL,
                started_at_ms INTEGER NULL,
                cpu_sample REAL NULL,
                ram_sample REAL NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_owner_state ON executions(owner_id, state);
            CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state);
            "#,
        )
        .map_err(|e| SupervisorError::StorageFailed(format!("Schema creation failed: {}", e)))?;
        Ok(())
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} {} ORDER BY workload_id", SELECT_COLUMNS, filter))?;
        let records = stmt
            .query_map(args, record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Handle columns a write is pinned to, both NULL when unpinned
fn pinned(handle: Option<&BackendHandle>) -> (Option<&'static str>, Option<String>) {
    match handle.map(BackendHandle::to_columns) {
        Some((kind, value)) => (Some(kind), Some(value)),
        None => (None, None),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let workload_id: String = row.get(0)?;
    let state: String = row.get(5)?;
    let state = state.parse::<ExecutionState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    let handle_kind: Option<String> = row.get(6)?;
    let handle_value: Option<String> = row.get(7)?;
    let started_at_ms: Option<i64> = row.get(8)?;

    Ok(ExecutionRecord {
        workload: Workload {
            workload_id: workload_id.clone(),
            owner_id: row.get(1)?,
            display_name: row.get(2)?,
            artifact_reference: row.get(3)?,
            auto_restart: row.get::<_, i64>(4)? != 0,
        },
        execution: Execution {
            execution_id: workload_id,
            backend_handle: BackendHandle::from_columns(handle_kind.as_deref(), handle_value.as_deref()),
            state,
            started_at: started_at_ms.and_then(ms_to_dt),
            cpu_sample: row.get(9)?,
            ram_sample: row.get(10)?,
        },
    })
}

impl ExecutionStore for SqliteExecutionStore {
    fn insert(&self, workload: &Workload) -> Result<ExecutionRecord> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO executions (workload_id, owner_id, display_name, artifact_ref, auto_restart, state, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                workload.workload_id,
                workload.owner_id,
                workload.display_name,
                workload.artifact_reference,
                workload.auto_restart as i64,
                ExecutionState::Uploaded.as_str(),
                now_ms(),
            ],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => SupervisorError::StorageFailed(format!(
                "workload {} already exists",
                workload.workload_id
            )),
            _ => SupervisorError::StorageFailed(format!("Failed to insert workload: {}", e)),
        })?;

        Ok(ExecutionRecord {
            workload: workload.clone(),
            execution: Execution::uploaded(&workload.workload_id),
        })
    }

    fn get(&self, workload_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.query("WHERE workload_id = ?1", &[&workload_id])?.into_iter().next())
    }

    fn get_running(&self) -> Result<Vec<ExecutionRecord>> {
        self.query("WHERE state = ?1", &[&ExecutionState::Running.as_str()])
    }

    fn get_restartable(&self) -> Result<Vec<ExecutionRecord>> {
        self.query(
            "WHERE state = ?1 AND auto_restart = 1",
            &[&ExecutionState::Crashed.as_str()],
        )
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.query("WHERE owner_id = ?1", &[&owner_id])
    }

    fn count_running(&self, owner_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE owner_id = ?1 AND state = ?2",
            params![owner_id, ExecutionState::Running.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn cas_update(
        &self,
        workload_id: &str,
        expected: ExecutionState,
        update: &StateUpdate,
    ) -> Result<bool> {
        check_transition(workload_id, expected, update.state)?;
        let (pin_kind, pin_value) = pinned(update.expected_handle.as_ref());

        let conn = self.conn.lock();
        let updated = match &update.handle {
            HandleUpdate::Keep => conn.execute(
                "UPDATE executions SET state = ?3, updated_at_ms = ?4
                 WHERE workload_id = ?1 AND state = ?2
                   AND (?5 IS NULL OR (handle_kind = ?5 AND handle_value = ?6))",
                params![workload_id, expected.as_str(), update.state.as_str(), now_ms(), pin_kind, pin_value],
            )?,
            HandleUpdate::Clear => conn.execute(
                "UPDATE executions SET state = ?3, handle_kind = NULL, handle_value = NULL, updated_at_ms = ?4
                 WHERE workload_id = ?1 AND state = ?2
                   AND (?5 IS NULL OR (handle_kind = ?5 AND handle_value = ?6))",
                params![workload_id, expected.as_str(), update.state.as_str(), now_ms(), pin_kind, pin_value],
            )?,
            HandleUpdate::Set(handle) => {
                let (kind, value) = handle.to_columns();
                conn.execute(
                    "UPDATE executions SET state = ?3, handle_kind = ?4, handle_value = ?5, updated_at_ms = ?6
                     WHERE workload_id = ?1 AND state = ?2
                       AND (?7 IS NULL OR (handle_kind = ?7 AND handle_value = ?8))",
                    params![
                        workload_id,
                        expected.as_str(),
                        update.state.as_str(),
                        kind,
                        value,
                        now_ms(),
                        pin_kind,
                        pin_value,
                    ],
                )?
            }
        };
        Ok(updated == 1)
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
        let Some(handle) = execution.backend_handle.as_ref() else {
            return Err(SupervisorError::StorageFailed(format!(
                "launched execution of {} has no handle",
                workload_id
            )));
        };
        let (kind, value) = handle.to_columns();
        let (pin_kind, pin_value) = pinned(expected_handle);
        let started_at_ms = execution.started_at.map(|t| t.timestamp_millis()).unwrap_or_else(now_ms);

        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE executions
            SET state = ?3, handle_kind = ?4, handle_value = ?5, started_at_ms = ?6,
                cpu_sample = NULL, ram_sample = NULL, updated_at_ms = ?7
            WHERE workload_id = ?1 AND state = ?2
              AND (?9 IS NULL OR (handle_kind = ?9 AND handle_value = ?10))
              AND (SELECT COUNT(*) FROM executions AS peer
                   WHERE peer.owner_id = executions.owner_id AND peer.state = ?3) < ?8
            "#,
            params![
                workload_id,
                expected.as_str(),
                ExecutionState::Running.as_str(),
                kind,
                value,
                started_at_ms,
                now_ms(),
                max_running as i64,
                pin_kind,
                pin_value,
            ],
        )?;
        Ok(updated == 1)
    }

    fn set_auto_restart(&self, workload_id: &str, auto_restart: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE executions SET auto_restart = ?2, updated_at_ms = ?3 WHERE workload_id = ?1",
            params![workload_id, auto_restart as i64, now_ms()],
        )?;
        Ok(updated == 1)
    }

    fn record_sample(&self, workload_id: &str, sample: &ResourceSample) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE executions SET cpu_sample = ?3, ram_sample = ?4
             WHERE workload_id = ?1 AND state = ?2",
            params![
                workload_id,
                ExecutionState::Running.as_str(),
                sample.cpu_percent,
                sample.ram_mb
            ],
        )?;
        Ok(())
    }
}
