use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use weave_core::error::Result;
use weave_core::traits::Tool;
use weave_core::types::ToolDefinition;
use weave_tools::ToolBroker;

use crate::ProtocolClient;

/// A broker tool whose handler lives in a provider subprocess.
pub struct RemoteTool {
    name: String,
    description: String,
    schema: Value,
    server: String,
    client: Arc<ProtocolClient>,
}

impl RemoteTool {
    pub fn new(definition: ToolDefinition, server: &str, client: Arc<ProtocolClient>) -> Self {
        Self {
            name: definition.name,
            description: definition.description,
            schema: definition.input_schema,
            server: server.to_string(),
            client,
        }
    }
}

impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn execute(&self, arguments: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.client.call_tool(&self.server, &self.name, arguments))
    }

    fn server(&self) -> Option<&str> {
        Some(&self.server)
    }
}

/// Register every listed tool of `server` into the broker.
pub fn register_remote_tools(
    broker: &mut ToolBroker,
    client: &Arc<ProtocolClient>,
    server: &str,
    definitions: Vec<ToolDefinition>,
) -> Result<usize> {
    let count = definitions.len();
    for def in definitions {
        let name = def.name.clone();
        broker.register(RemoteTool::new(def, server, client.clone()))?;
        debug!(tool = %name, server = %server, "Registered remote tool");
    }
    Ok(count)
}
