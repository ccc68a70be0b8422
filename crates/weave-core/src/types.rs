use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single workflow unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every unit succeeded.
    Succeeded,
    /// The run finished but at least one unit failed or was skipped.
    Failed,
    /// Stopped early by `stop_on_error` or an explicit abort.
    Aborted,
    /// The workflow deadline elapsed.
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// A tool invocation requested by the unit runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Correlation id echoed back in the matching `ToolResult`.
    pub id: String,
}

impl ToolCall {
    pub fn new(
        name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            id: Uuid::new_v4().to_string(),
        }
    }
}

/// Outcome of a tool invocation. Local and remote tools produce the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub call_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, value: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            tool: call.name.clone(),
            call_id: call.id.clone(),
            success: true,
            value: Some(value),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool: call.name.clone(),
            call_id: call.id.clone(),
            success: false,
            value: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Tool definition handed to the unit runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Originating remote provider, `None` for local tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// Everything the unit runner needs for one invocation.
#[derive(Debug, Clone)]
pub struct UnitRequest {
    pub run_id: RunId,
    pub unit_id: String,
    /// 0-based attempt index (retries increment it).
    pub attempt: u32,
    /// 0-based tool round within this attempt.
    pub round: usize,
    pub tools: Vec<ToolDefinition>,
    /// Outputs of the unit's direct dependencies, keyed by unit id.
    pub inputs: BTreeMap<String, String>,
    /// Tool results accumulated over previous rounds of this attempt.
    pub tool_results: Vec<ToolResult>,
}

/// What the unit runner produced.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitResponse {
    /// The unit is done.
    Complete { output: String, tokens_used: u64 },
    /// The unit needs these tools executed before it can continue.
    ToolCalls {
        calls: Vec<ToolCall>,
        tokens_used: u64,
    },
}

impl UnitResponse {
    pub fn complete(output: impl Into<String>) -> Self {
        Self::Complete {
            output: output.into(),
            tokens_used: 0,
        }
    }

    pub fn tokens_used(&self) -> u64 {
        match self {
            Self::Complete { tokens_used, .. } | Self::ToolCalls { tokens_used, .. } => {
                *tokens_used
            }
        }
    }
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Run started and the lock is held.
    RunStarted { run_id: RunId, workflow: String },
    /// A unit invocation began.
    UnitStarted {
        run_id: RunId,
        unit: String,
        attempt: u32,
    },
    /// A unit failed with a retryable error and will be re-invoked.
    UnitRetrying {
        run_id: RunId,
        unit: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Tool execution started.
    ToolStarted {
        run_id: RunId,
        unit: String,
        call: ToolCall,
    },
    /// Tool execution completed.
    ToolFinished {
        run_id: RunId,
        unit: String,
        result: ToolResult,
    },
    /// A unit reached a terminal status.
    UnitFinished {
        run_id: RunId,
        unit: String,
        status: UnitStatus,
        duration_ms: u64,
    },
    /// The run reached a terminal status.
    RunFinished { run_id: RunId, status: RunStatus },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::UnitStarted { run_id, .. }
            | Self::UnitRetrying { run_id, .. }
            | Self::ToolStarted { run_id, .. }
            | Self::ToolFinished { run_id, .. }
            | Self::UnitFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}
