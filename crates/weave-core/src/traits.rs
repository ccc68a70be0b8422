use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ToolDefinition, UnitRequest, UnitResponse};

/// The "run one unit" collaborator (typically an LLM call).
pub trait UnitRunner: Send + Sync + 'static {
    /// Execute one round of a unit. May return tool calls instead of a final output.
    fn run(&self, request: UnitRequest) -> BoxFuture<'_, Result<UnitResponse>>;
}

/// A named callable the broker can dispatch to.
///
/// Execution is always treated as potentially suspending: handlers that
/// finish immediately simply return a ready future.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in unit tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Per-tool timeout override. `None` uses the broker's `tool_timeout`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Remote provider this tool is served by, if any.
    fn server(&self) -> Option<&str> {
        None
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            server: self.server().map(str::to_string),
        }
    }
}
