use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use weave_core::error::{Result, WeaveError};
use weave_core::types::{RunId, RunStatus};

use super::{RunSummary, StateStore};
use crate::run::Run;

/// Run snapshots in a single SQLite table. Each save is one transaction,
/// so readers see either the previous or the new snapshot.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: rusqlite::Error) -> WeaveError {
    WeaveError::State(format!("{}: {}", context, e))
}

impl SqliteStateStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeaveError::State(format!("failed to create state directory: {}", e))
            })?;
        }
        let conn =
            Connection::open(path).map_err(|e| db_err("failed to open state store", e))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("failed to open in-memory state store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 workflow TEXT NOT NULL,
                 status TEXT NOT NULL,
                 started_at TEXT NOT NULL,
                 record_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_workflow
                 ON runs(workflow, started_at DESC);",
        )
        .map_err(|e| db_err("failed to initialize state schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeaveError::State(format!("state store lock poisoned: {}", e)))
    }
}

impl StateStore for SqliteStateStore {
    fn save_state(&self, run: &Run) -> Result<()> {
        let json = serde_json::to_string(run)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (run_id, workflow, status, started_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 record_json = excluded.record_json",
            params![
                run.id.as_str(),
                run.workflow,
                run.status.to_string(),
                run.started_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                json,
            ],
        )
        .map_err(|e| db_err("failed to save run", e))?;
        Ok(())
    }

    fn load_state(&self, run_id: &RunId) -> Result<Run> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("failed to load run", e))?;

        let json = json.ok_or_else(|| WeaveError::NotFound(format!("run '{}'", run_id)))?;
        serde_json::from_str(&json)
            .map_err(|e| WeaveError::State(format!("corrupt record for run '{}': {}", run_id, e)))
    }

    fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, workflow, status, started_at FROM runs
                 WHERE workflow = ?1
                 ORDER BY started_at DESC",
            )
            .map_err(|e| db_err("failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![workflow], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| db_err("failed to list runs", e))?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, workflow, status, started_at) =
                row.map_err(|e| db_err("failed to read run row", e))?;
            let status: RunStatus = serde_json::from_value(serde_json::Value::String(status))?;
            let started_at = DateTime::parse_from_rfc3339(&started_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| WeaveError::State(format!("bad timestamp for run '{}': {}", id, e)))?;
            runs.push(RunSummary {
                id: RunId(id),
                workflow,
                status,
                started_at,
            });
        }
        Ok(runs)
    }
}
