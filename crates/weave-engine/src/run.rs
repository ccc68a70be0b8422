use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weave_core::types::{RunId, RunStatus, ToolResult, UnitStatus};

/// Terminal outcome of one unit within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Invocations made, including retries.
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolResult>,
}

impl UnitOutcome {
    pub fn skipped(unit: &str, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.to_string(),
            status: UnitStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            attempts: 0,
            duration_ms: 0,
            tool_calls: Vec::new(),
        }
    }
}

/// One end-to-end execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Per-unit outcomes in completion order.
    #[serde(default)]
    pub outcomes: Vec<UnitOutcome>,
}

impl Run {
    pub fn new(workflow: &str) -> Self {
        Self::with_id(RunId::new(), workflow)
    }

    pub fn with_id(id: RunId, workflow: &str) -> Self {
        Self {
            id,
            workflow: workflow.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            outcomes: Vec::new(),
        }
    }

    pub fn outcome(&self, unit: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit == unit)
    }

    pub fn status_of(&self, unit: &str) -> Option<UnitStatus> {
        self.outcome(unit).map(|o| o.status)
    }

    pub fn output_of(&self, unit: &str) -> Option<&str> {
        self.outcome(unit).and_then(|o| o.output.as_deref())
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration, if finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
