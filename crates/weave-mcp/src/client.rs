use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use weave_core::config::McpServerConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::types::ToolDefinition;

use crate::protocol::{self, CallToolResult, ListToolsResult};
use crate::session::ProtocolSession;

/// Upper bound on `tools/list` pages, guards against a provider that
/// keeps handing back a cursor.
const MAX_LIST_PAGES: usize = 100;

/// Manages one session per configured remote tool provider.
#[derive(Default)]
pub struct ProtocolClient {
    sessions: Mutex<HashMap<String, Arc<ProtocolSession>>>,
    configs: Mutex<HashMap<String, McpServerConfig>>,
}

impl ProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a provider and complete the handshake. A session already
    /// running under the same name is shut down first.
    pub async fn start(&self, server: &str, config: &McpServerConfig) -> Result<()> {
        let previous = self.sessions.lock().await.remove(server);
        if let Some(old) = previous {
            debug!(server = %server, "Replacing running session");
            old.shutdown().await;
        }

        self.configs
            .lock()
            .await
            .insert(server.to_string(), config.clone());

        let session = ProtocolSession::start(server, config).await?;
        info!(
            server = %server,
            provider = session.server_info().unwrap_or("unknown"),
            "Tool provider connected"
        );
        self.sessions
            .lock()
            .await
            .insert(server.to_string(), Arc::new(session));
        Ok(())
    }

    /// Live session for `server`, restarting it if it died and the
    /// provider is configured to restart on exit.
    async fn session(&self, server: &str) -> Result<Arc<ProtocolSession>> {
        let existing = self.sessions.lock().await.get(server).cloned();
        if let Some(session) = existing {
            if session.is_alive() {
                return Ok(session);
            }
        }

        let config = self
            .configs
            .lock()
            .await
            .get(server)
            .cloned()
            .ok_or_else(|| WeaveError::NotFound(format!("tool provider '{}'", server)))?;

        if !config.restart_on_exit {
            return Err(WeaveError::ProcessExited {
                server: server.to_string(),
                status: "session invalidated and restart_on_exit is off".into(),
            });
        }

        warn!(server = %server, "Tool provider not running, restarting");
        let session = Arc::new(ProtocolSession::start(server, &config).await?);
        self.sessions
            .lock()
            .await
            .insert(server.to_string(), session.clone());
        Ok(session)
    }

    /// Fetch every tool the provider exposes, following `nextCursor`.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDefinition>> {
        let session = self.session(server).await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };
            let raw = session.request(protocol::METHOD_TOOLS_LIST, params).await?;
            let page: ListToolsResult = serde_json::from_value(raw).map_err(|e| {
                WeaveError::protocol(server, format!("malformed tools/list response: {}", e))
            })?;

            tools.extend(page.tools.into_iter().map(|t| t.into_definition(server)));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    debug!(server = %server, count = tools.len(), "Listed remote tools");
                    return Ok(tools);
                }
            }
        }

        warn!(server = %server, pages = MAX_LIST_PAGES, "tools/list pagination did not terminate");
        Ok(tools)
    }

    /// Invoke a remote tool. Provider-reported tool errors (`isError`)
    /// come back as `ToolExecution`; transport failures are not retried here.
    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value> {
        let session = self.session(server).await?;
        let params = serde_json::json!({
            "name": name,
            "arguments": Value::Object(arguments),
        });

        debug!(server = %server, tool = %name, "Calling remote tool");
        let raw = session.request(protocol::METHOD_TOOLS_CALL, params).await?;
        let result: CallToolResult = serde_json::from_value(raw).map_err(|e| {
            WeaveError::protocol(server, format!("malformed tools/call response: {}", e))
        })?;

        if result.is_error {
            return Err(WeaveError::ToolExecution {
                tool: name.to_string(),
                message: result.text(),
            });
        }
        Ok(result.into_value())
    }

    pub async fn is_running(&self, server: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(server)
            .map(|s| s.is_alive())
            .unwrap_or(false)
    }

    /// Names of providers with a session (live or not), sorted.
    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Gracefully stop one provider. Returns its exit status if it was running.
    pub async fn shutdown(&self, server: &str) -> Option<String> {
        let session = self.sessions.lock().await.remove(server)?;
        let status = session.shutdown().await;
        info!(server = %server, status = %status, "Tool provider shut down");
        Some(status)
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<(String, Arc<ProtocolSession>)> =
            self.sessions.lock().await.drain().collect();
        let stops = sessions.iter().map(|(name, session)| async move {
            let status = session.shutdown().await;
            info!(server = %name, status = %status, "Tool provider shut down");
        });
        futures::future::join_all(stops).await;
    }
}
