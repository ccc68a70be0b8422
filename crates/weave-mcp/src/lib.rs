mod bridge;
mod client;
pub mod protocol;
mod session;

pub use bridge::{register_remote_tools, RemoteTool};
pub use client::ProtocolClient;
pub use session::ProtocolSession;

use std::sync::Arc;

use tracing::{debug, warn};

use weave_core::config::{McpConfig, McpServerConfig};
use weave_core::error::Result;
use weave_tools::ToolBroker;

/// Start a provider and register its tools into the broker.
/// Returns the number of tools registered.
pub async fn connect_and_register(
    client: &Arc<ProtocolClient>,
    server: &str,
    config: &McpServerConfig,
    broker: &mut ToolBroker,
) -> Result<usize> {
    client.start(server, config).await?;
    let tools = client.list_tools(server).await?;
    register_remote_tools(broker, client, server, tools)
}

/// Connect every enabled provider. A provider that fails to start is
/// logged and left out; the others still register.
pub async fn connect_all(
    client: &Arc<ProtocolClient>,
    config: &McpConfig,
    broker: &mut ToolBroker,
) -> Result<usize> {
    let mut total = 0;
    let mut names: Vec<(&String, &McpServerConfig)> =
        config.servers.iter().filter(|(_, c)| c.enabled).collect();
    names.sort_by(|a, b| a.0.cmp(b.0));

    for (name, server) in names {
        match connect_and_register(client, name, server, broker).await {
            Ok(count) => total += count,
            Err(e @ weave_core::WeaveError::DuplicateTool(_)) => return Err(e),
            Err(e) => warn!(server = %name, error = %e, "Tool provider unavailable"),
        }
    }
    Ok(total)
}

/// Re-fetch tools from a provider and replace its entries in the broker.
/// Returns the new tool count.
pub async fn refresh_tools(
    client: &Arc<ProtocolClient>,
    server: &str,
    broker: &mut ToolBroker,
) -> Result<usize> {
    let removed = broker.unregister_server(server);
    debug!(server = %server, removed, "Unregistered old remote tools");

    let tools = client.list_tools(server).await?;
    let count = register_remote_tools(broker, client, server, tools)?;

    debug!(server = %server, new_count = count, "Refreshed remote tools");
    Ok(count)
}
