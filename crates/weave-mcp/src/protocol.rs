//! Newline-delimited JSON-RPC 2.0 messages exchanged with tool providers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weave_core::types::ToolDefinition;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

pub const METHOD_NOT_FOUND: i64 = -32601;

/// Outgoing request (has an id and expects a response).
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Outgoing notification (no id, no response).
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A line received from the provider, classified.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response {
        id: Value,
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Well-formed JSON carrying an id but no usable `result` or `error`.
    MalformedResponse { id: Value, reason: String },
    /// Request initiated by the provider.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification { method: String, params: Value },
}

/// Classify one line of provider output.
pub fn parse_line(line: &str) -> serde_json::Result<Incoming> {
    let mut value: Value = serde_json::from_str(line)?;
    let obj = value.as_object_mut().ok_or_else(|| {
        <serde_json::Error as serde::de::Error>::custom("message is not a JSON object")
    })?;

    let id = obj.remove("id");
    let method = obj
        .remove("method")
        .and_then(|m| m.as_str().map(str::to_string));
    let params = obj.remove("params").unwrap_or(Value::Null);

    Ok(match (id, method) {
        (Some(id), Some(method)) => Incoming::Request { id, method, params },
        (None, Some(method)) => Incoming::Notification { method, params },
        (Some(id), None) => {
            if let Some(error) = obj.remove("error") {
                match serde_json::from_value::<RpcError>(error.clone()) {
                    Ok(error) => Incoming::Response {
                        id,
                        outcome: Err(error),
                    },
                    // Keep the id so the pending call resolves.
                    Err(_) => Incoming::MalformedResponse {
                        id,
                        reason: format!("unrecognised error object: {}", error),
                    },
                }
            } else if let Some(result) = obj.remove("result") {
                Incoming::Response {
                    id,
                    outcome: Ok(result),
                }
            } else {
                Incoming::MalformedResponse {
                    id,
                    reason: "response carries neither result nor error".to_string(),
                }
            }
        }
        (None, None) => {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "message has neither id nor method",
            ))
        }
    })
}

/// Encode a request as one line (without the trailing newline).
pub fn encode_request(id: u64, method: &str, params: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    })
}

pub fn encode_notification(method: &str, params: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&Notification {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
    })
}

pub fn encode_response(id: &Value, outcome: std::result::Result<Value, RpcError>) -> serde_json::Result<String> {
    let msg = match outcome {
        Ok(result) => serde_json::json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result}),
        Err(error) => serde_json::json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error}),
    };
    serde_json::to_string(&msg)
}

/// Request ids we issue are unsigned integers; accept numeric strings too.
pub fn id_as_u64(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        }
    })
}

/// The parts of an `initialize` result we rely on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub capabilities: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A tool descriptor from `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

impl RemoteToolDescriptor {
    pub fn into_definition(self, server: &str) -> ToolDefinition {
        let description = self
            .description
            .unwrap_or_else(|| format!("Remote tool '{}' from {}", self.name, server));
        ToolDefinition {
            name: self.name,
            description,
            input_schema: self
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            server: Some(server.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<RemoteToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
    Image {
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    Resource { resource: Value },
    #[serde(other)]
    Unknown,
}

impl CallToolResult {
    /// Flatten content blocks into text.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ContentItem::Text { text } => text.clone(),
                ContentItem::Image { mime_type } => {
                    format!("[image: {}]", mime_type.as_deref().unwrap_or("unknown"))
                }
                ContentItem::Resource { resource } => resource.to_string(),
                ContentItem::Unknown => "[unsupported content]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Structured content if present, otherwise the flattened text.
    pub fn into_value(self) -> Value {
        match self.structured_content {
            Some(v) => v,
            None => Value::String(self.text()),
        }
    }
}
