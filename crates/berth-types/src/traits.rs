/// Trait contracts for the berth gateway.
///
/// The transport seam is defined here so that the registry and proxy crates
/// code against the interface rather than against concrete transports, and
/// so tests can substitute canned implementations.
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::compliance;
use crate::errors::GatewayError;
use crate::messages::{HandshakeResult, JsonRpcMessage, ToolCatalogReply, ToolDef};

/// Uniform client interface over a backend MCP server, regardless of
/// transport (LOCAL child process, EVENT stream, plain HTTP).
///
/// `call` correlates a request with its response by JSON-RPC id; multiple
/// calls may be in flight concurrently and complete out of order.
/// Server-originated requests and notifications surface on `subscribe`.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Synchronous request/response. The caller owns the deadline.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError>;

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError>;

    /// Stream of inbound messages the backend originates on its own.
    /// Meaningful for LOCAL and EVENT; HTTP yields only out-of-band replies.
    fn subscribe(&self) -> Option<broadcast::Receiver<JsonRpcMessage>>;

    /// Tear the connection down. Idempotent. For LOCAL this terminates the
    /// child process tree.
    async fn close(&self) -> Result<(), GatewayError>;

    /// Whether the underlying connection is still usable.
    fn is_alive(&self) -> bool;

    /// Run the MCP handshake: `initialize` followed by
    /// `notifications/initialized`. The response is compliance-normalized
    /// before parsing. Accepts whatever revision the backend negotiates.
    async fn handshake(
        &self,
        client_name: &str,
        client_version: &str,
        protocol_version: &str,
    ) -> Result<HandshakeResult, GatewayError> {
        let params = json!({
            "protocolVersion": protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": client_name,
                "version": client_version,
            },
        });
        let raw = self.call("initialize", Some(params)).await?;
        let fixed = compliance::normalize_initialize_result(raw);
        let result = HandshakeResult::from_value(&fixed)?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Fetch and normalize the backend's tool catalog, parsing the reply
    /// defensively into the known shapes.
    async fn list_tools(&self) -> Result<Vec<ToolDef>, GatewayError> {
        let raw = self.call("tools/list", None).await?;
        let catalog = ToolCatalogReply::parse(&raw)?;
        Ok(compliance::normalize_tools(catalog.into_raw_tools()))
    }
}
