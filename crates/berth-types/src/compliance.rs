//! MCP compliance normalization.
//!
//! Backends disagree about where fields live and what shape capabilities
//! take. Every handshake response and tool definition crossing the gateway
//! boundary passes through these repairs so that clients always see
//! messages conforming to the target MCP revision:
//! - `instructions` is a top-level optional field, never inside `serverInfo`
//! - capability-presence subfields are objects, never null
//! - tools always carry a name, a description, and an object `inputSchema`
//!
//! All transforms are idempotent: applying them twice yields the same value
//! as applying them once.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::messages::{default_input_schema, ToolDef};
use crate::{PROTOCOL_VERSION_PRIMARY, SUPPORTED_PROTOCOL_VERSIONS};

/// Repair an `InitializeResult` value in place and return it.
pub fn normalize_initialize_result(mut response: Value) -> Value {
    let Some(map) = response.as_object_mut() else {
        return response;
    };

    if !map.contains_key("protocolVersion") {
        map.insert(
            "protocolVersion".to_string(),
            Value::String(PROTOCOL_VERSION_PRIMARY.to_string()),
        );
    }

    let caps = map
        .entry("capabilities")
        .or_insert_with(|| json!({}));
    if !caps.is_object() {
        *caps = json!({});
    }
    if let Some(caps) = caps.as_object_mut() {
        normalize_capabilities(caps);
    }

    let server_info = map.entry("serverInfo").or_insert_with(|| json!({}));
    if !server_info.is_object() {
        *server_info = json!({});
    }
    let mut relocated_instructions: Option<String> = None;
    if let Some(info) = server_info.as_object_mut() {
        if !info.contains_key("name") {
            info.insert("name".to_string(), Value::String("unknown".to_string()));
        }
        if !info.contains_key("version") {
            info.insert("version".to_string(), Value::String("0.0.0".to_string()));
        }
        // Instructions belong at the top level of the result.
        if let Some(value) = info.remove("instructions") {
            if let Some(text) = non_empty_string(&value) {
                relocated_instructions = Some(text);
            }
        }
        // Dropped from serverInfo in the 2025-03-26 revision.
        info.remove("description");
    }
    if let Some(text) = relocated_instructions {
        map.entry("instructions").or_insert(Value::String(text));
    }

    // An empty or non-string instructions field is omitted entirely.
    if let Some(value) = map.get("instructions") {
        match non_empty_string(value) {
            Some(text) => {
                map.insert("instructions".to_string(), Value::String(text));
            }
            None => {
                map.remove("instructions");
            }
        }
    }

    response
}

fn normalize_capabilities(caps: &mut Map<String, Value>) {
    // Null capability presence means "present, no options".
    for key in ["logging", "prompts", "resources", "tools", "experimental"] {
        if matches!(caps.get(key), Some(Value::Null)) {
            caps.insert(key.to_string(), json!({}));
        }
    }
    if let Some(tools) = caps.get_mut("tools") {
        if !tools.is_object() {
            *tools = json!({});
        }
    }
    if let Some(resources) = caps.get_mut("resources") {
        if !resources.is_object() {
            *resources = json!({});
        }
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Repair a raw tool definition. Returns `None` (and logs) when the tool
/// has no usable name and must be dropped from the catalog.
pub fn normalize_tool(raw: &Value) -> Option<ToolDef> {
    let obj = raw.as_object()?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let Some(name) = name else {
        warn!(tool = %raw, "dropping tool definition without a name");
        return None;
    };

    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let input_schema = match obj.get("inputSchema") {
        Some(schema) if schema.is_object() => schema.clone(),
        Some(other) => {
            debug!(tool = name, schema = %other, "replacing non-object inputSchema");
            default_input_schema()
        }
        None => default_input_schema(),
    };

    Some(ToolDef {
        name: name.to_string(),
        description,
        input_schema,
    })
}

/// Normalize an entire raw catalog, dropping unusable entries.
pub fn normalize_tools(raw: Vec<Value>) -> Vec<ToolDef> {
    raw.iter().filter_map(normalize_tool).collect()
}

/// Pick the protocol revision to echo in an outgoing `initialize` response:
/// the client's requested revision when the gateway supports it, otherwise
/// `None` (the caller falls back to the backend's negotiated revision or
/// the primary).
pub fn echo_version(requested: Option<&str>) -> Option<&str> {
    requested.filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
}

/// Map an HTTP status into the JSON-RPC server error range
/// (`-32000..=-32099`). Non-error statuses map to the range start.
pub fn http_status_to_code(status: u16) -> i64 {
    let offset = match status {
        400..=499 => i64::from(status) - 400,
        500..=599 => 50 + (i64::from(status) - 500),
        _ => 0,
    };
    crate::messages::codes::SERVER_ERROR - offset.min(99)
}

// ============================================================
// Tests
// ============================================================
