//! Durable run state.

mod json;
mod sqlite;

pub use json::JsonStateStore;
pub use sqlite::SqliteStateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weave_core::config::{StateBackend, StateConfig};
use weave_core::error::Result;
use weave_core::types::{RunId, RunStatus};

use crate::run::Run;

/// Listing entry for a persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            workflow: run.workflow.clone(),
            status: run.status,
            started_at: run.started_at,
        }
    }
}

/// Snapshot persistence for runs. Saves replace the previous snapshot
/// atomically; readers never observe a partial record.
pub trait StateStore: Send + Sync {
    fn save_state(&self, run: &Run) -> Result<()>;

    /// Last persisted snapshot, or `WeaveError::NotFound`.
    fn load_state(&self, run_id: &RunId) -> Result<Run>;

    /// Runs of `workflow`, newest first.
    fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>>;
}

/// Open the backend selected in `[state]`.
pub fn open_store(config: &StateConfig) -> Result<Box<dyn StateStore>> {
    let dir = config.state_dir();
    Ok(match config.backend {
        StateBackend::Json => Box::new(JsonStateStore::new(dir.join("runs"))?),
        StateBackend::Sqlite => Box::new(SqliteStateStore::open(&dir.join("state.db"))?),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use weave_core::types::{ToolCall, ToolResult, UnitStatus};

    use super::*;
    use crate::run::UnitOutcome;

    /// A run aborted mid-flight with mixed outcomes.
    pub fn partial_run(workflow: &str) -> Run {
        let mut run = Run::new(workflow);
        let call = ToolCall::new("search", serde_json::Map::new());
        run.outcomes.push(UnitOutcome {
            unit: "research".into(),
            status: UnitStatus::Succeeded,
            output: Some("three sources".into()),
            error: None,
            attempts: 2,
            duration_ms: 1200,
            tool_calls: vec![ToolResult::success(&call, serde_json::json!(["a", "b"]), 40)],
        });
        run.outcomes.push(UnitOutcome {
            unit: "draft".into(),
            status: UnitStatus::Failed,
            output: None,
            error: Some("Cancelled".into()),
            attempts: 1,
            duration_ms: 300,
            tool_calls: vec![],
        });
        run.outcomes.push(UnitOutcome::skipped("review", "run aborted"));
        run.finish(RunStatus::Aborted);
        run
    }
}
