/// Wire types shared across all berth subsystems.
///
/// These types are the lingua franca of the gateway: every crate that talks
/// MCP imports the JSON-RPC envelope and tool shapes from here.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::GatewayError;

/// Standard JSON-RPC 2.0 error codes plus the server-error range the
/// gateway maps transport failures into.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Start of the implementation-defined server error range.
    pub const SERVER_ERROR: i64 = -32000;
    /// End (inclusive, most negative) of the server error range.
    pub const SERVER_ERROR_END: i64 = -32099;
}

// ============================================================
// JSON-RPC envelope
// ============================================================

/// A JSON-RPC 2.0 message for MCP communication.
///
/// One struct covers requests, notifications, and both response shapes;
/// absent fields are omitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (absent for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result (for success responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (for failure responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcMessage {
    pub fn request(id: Value, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self::error_response_with_data(id, code, message, None)
    }

    pub fn error_response_with_data(
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Build the error envelope for a failed gateway operation, preserving
    /// the original request id.
    pub fn from_gateway_error(id: Option<Value>, err: &GatewayError) -> Self {
        let data = match err {
            GatewayError::Peer { data, .. } => data.clone(),
            _ => None,
        };
        Self::error_response_with_data(id, err.jsonrpc_code(), err.to_string(), data)
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Basic envelope validation: `jsonrpc` is "2.0" and the message is one
    /// of the three legal shapes.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.jsonrpc != "2.0" {
            return Err(GatewayError::Protocol(format!(
                "unsupported jsonrpc version: {:?}",
                self.jsonrpc
            )));
        }
        if self.method.is_none() && self.result.is_none() && self.error.is_none() {
            return Err(GatewayError::Protocol(
                "message is neither request, notification, nor response".to_string(),
            ));
        }
        if self.result.is_some() && self.error.is_some() {
            return Err(GatewayError::Protocol(
                "response carries both result and error".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================
// MCP tool types
// ============================================================

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    /// Tool name, unique within a backend.
    pub name: String,
    /// Tool description; empty when the backend provided none.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input. Always an object.
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
}

pub(crate) fn default_input_schema() -> Value {
    json!({"type": "object"})
}

/// The shapes a backend's `tools/list` reply is allowed to take.
///
/// Backends in the wild return a `{tools: [...]}` object, a bare array, a
/// single tool object, or nothing at all. Anything else is a protocol error.
#[derive(Debug, Clone)]
pub enum ToolCatalogReply {
    Tools(Vec<Value>),
    Single(Value),
    Empty,
}

impl ToolCatalogReply {
    /// Parse a raw reply value defensively into one of the known shapes.
    pub fn parse(raw: &Value) -> Result<Self, GatewayError> {
        match raw {
            Value::Null => Ok(ToolCatalogReply::Empty),
            Value::Object(map) => {
                if let Some(tools) = map.get("tools") {
                    match tools {
                        Value::Array(items) => Ok(ToolCatalogReply::Tools(items.clone())),
                        Value::Null => Ok(ToolCatalogReply::Empty),
                        other => Err(GatewayError::Protocol(format!(
                            "tools field is not an array: {other}"
                        ))),
                    }
                } else if map.contains_key("name") {
                    Ok(ToolCatalogReply::Single(raw.clone()))
                } else if map.is_empty() {
                    Ok(ToolCatalogReply::Empty)
                } else {
                    Err(GatewayError::Protocol(
                        "tools/list reply has neither tools nor a tool shape".to_string(),
                    ))
                }
            }
            Value::Array(items) => Ok(ToolCatalogReply::Tools(items.clone())),
            other => Err(GatewayError::Protocol(format!(
                "unrecognized tools/list reply: {other}"
            ))),
        }
    }

    /// Flatten into raw tool values, in the backend's declared order.
    pub fn into_raw_tools(self) -> Vec<Value> {
        match self {
            ToolCatalogReply::Tools(items) => items,
            ToolCatalogReply::Single(item) => vec![item],
            ToolCatalogReply::Empty => Vec::new(),
        }
    }
}

// ============================================================
// Handshake result
// ============================================================

/// Parsed, normalized result of an MCP `initialize` exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl HandshakeResult {
    /// Parse a (normalized) `InitializeResult` value.
    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let protocol_version = value
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::Protocol("initialize result missing protocolVersion".to_string())
            })?
            .to_string();
        let capabilities = value
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if !capabilities.is_object() {
            return Err(GatewayError::Protocol(
                "initialize result capabilities is not an object".to_string(),
            ));
        }
        let server_info = value.get("serverInfo").cloned().unwrap_or_else(|| json!({}));
        let instructions = value
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty());
        Ok(Self {
            protocol_version,
            capabilities,
            server_info,
            instructions,
        })
    }

    /// Whether the backend advertised the given capability as an object.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .get(name)
            .map(Value::is_object)
            .unwrap_or(false)
    }
}

// ============================================================
// Tests
// ============================================================
