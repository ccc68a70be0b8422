use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, warn};

use weave_core::config::DuplicatePolicy;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::Tool;
use weave_core::types::{ToolCall, ToolDefinition, ToolResult};

/// Registry and dispatcher of callable tools.
///
/// One broker is owned per scheduler and shared by reference; there is no
/// process-wide registry.
pub struct ToolBroker {
    tools: HashMap<String, Arc<dyn Tool>>,
    on_duplicate: DuplicatePolicy,
    tool_timeout: Duration,
}

impl ToolBroker {
    pub fn new(on_duplicate: DuplicatePolicy, tool_timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            on_duplicate,
            tool_timeout,
        }
    }

    /// Register a tool, applying the duplicate-name policy.
    pub fn register(&mut self, tool: impl Tool) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if let Some(existing) = self.tools.get(&name) {
            match self.on_duplicate {
                DuplicatePolicy::Reject => return Err(WeaveError::DuplicateTool(name)),
                DuplicatePolicy::Overwrite => {
                    warn!(
                        tool = %name,
                        previous_server = existing.server().unwrap_or("local"),
                        new_server = tool.server().unwrap_or("local"),
                        "Tool re-registered, replacing previous handler"
                    );
                }
            }
        }
        debug!(tool = %name, server = tool.server().unwrap_or("local"), "Registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Drop every tool served by `server`. Returns how many were removed.
    pub fn unregister_server(&mut self, server: &str) -> usize {
        let before = self.tools.len();
        self.tools.retain(|_, t| t.server() != Some(server));
        before - self.tools.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions for the named tools, in the order given. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(tool) => Some(tool.definition()),
                None => {
                    warn!(tool = %name, "Declared tool is not registered");
                    None
                }
            })
            .collect()
    }

    /// Execute a tool call. Every failure, including timeouts and panics,
    /// comes back as a `ToolResult` with `success == false`.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();

        let Some(tool) = self.get(&call.name) else {
            return ToolResult::failure(
                call,
                WeaveError::ToolNotFound(call.name.clone()).to_string(),
                0,
            );
        };

        let timeout = tool.timeout().unwrap_or(self.tool_timeout);
        let fut = AssertUnwindSafe(tool.execute(call.arguments.clone())).catch_unwind();
        let outcome = tokio::time::timeout(timeout, fut).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Ok(value))) => ToolResult::success(call, value, elapsed_ms),
            Ok(Ok(Err(e))) => ToolResult::failure(call, e.to_string(), elapsed_ms),
            Ok(Err(_panic)) => ToolResult::failure(
                call,
                WeaveError::ToolExecution {
                    tool: call.name.clone(),
                    message: "handler panicked".into(),
                }
                .to_string(),
                elapsed_ms,
            ),
            Err(_) => ToolResult::failure(
                call,
                WeaveError::Timeout {
                    what: format!("tool '{}'", call.name),
                    secs: timeout.as_secs_f64(),
                }
                .to_string(),
                elapsed_ms,
            ),
        };

        if !result.success {
            warn!(
                tool = %call.name,
                call_id = %call.id,
                error = result.error.as_deref().unwrap_or(""),
                "Tool call failed"
            );
        }
        result
    }
}

impl Default for ToolBroker {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default(), Duration::from_secs(30))
    }
}
