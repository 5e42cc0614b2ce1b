//! Per-proxy request routing.
//!
//! Policy for a JSON-RPC message arriving on a proxy, from any client
//! transport:
//! - `initialize`: answered locally with the negotiated revision, merged
//!   capabilities, and the instructions priority chain
//! - `tools/list`: the cached effective tool list (`nextCursor` always "")
//! - `tools/call`: exposure-filtered, then forwarded
//! - `resources/list`, `resources/templates/list`: forwarded when the
//!   backend advertises the resources capability, synthesized empty otherwise
//! - `notifications/*`: forwarded as notifications
//! - anything else: forwarded as a call

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use berth_registry::{BackendRegistry, BackendState};
use berth_types::compliance::{echo_version, normalize_initialize_result};
use berth_types::messages::codes;
use berth_types::{
    GatewayError, JsonRpcMessage, ProxyConfig, ProxyTransport, ToolDef,
    PROTOCOL_VERSION_PRIMARY, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Forwarded calls inherit the HTTP-transport deadline: streaming tools
/// may take long.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================
// Proxy records
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Stopped,
    Running,
    Error,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Stopped => write!(f, "stopped"),
            ProxyState::Running => write!(f, "running"),
            ProxyState::Error => write!(f, "error"),
        }
    }
}

struct Proxy {
    config: ProxyConfig,
    state: ProxyState,
    last_error: Option<String>,
    /// Backend tools filtered by `exposed_tools`; refreshed on backend
    /// re-verification.
    effective_tools: Vec<ToolDef>,
}

/// Serializable proxy view for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub backend_name: String,
    pub endpoint: String,
    pub transport: ProxyTransport,
    pub state: ProxyState,
    pub auto_start: bool,
    pub last_error: Option<String>,
    pub exposed_tools: Vec<String>,
    pub tool_count: usize,
    pub tools: Vec<ToolDef>,
}

// ============================================================
// Engine
// ============================================================

struct EngineInner {
    registry: BackendRegistry,
    proxies: RwLock<HashMap<String, Proxy>>,
    gateway_name: String,
    gateway_version: String,
}

#[derive(Clone)]
pub struct ProxyEngine {
    inner: Arc<EngineInner>,
}

impl ProxyEngine {
    pub fn new(
        registry: BackendRegistry,
        gateway_name: impl Into<String>,
        gateway_version: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                proxies: RwLock::new(HashMap::new()),
                gateway_name: gateway_name.into(),
                gateway_version: gateway_version.into(),
            }),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    pub async fn load(&self, configs: impl IntoIterator<Item = ProxyConfig>) {
        let mut proxies = self.inner.proxies.write().await;
        for config in configs {
            proxies.entry(config.name.clone()).or_insert_with(|| Proxy {
                config,
                state: ProxyState::Stopped,
                last_error: None,
                effective_tools: Vec::new(),
            });
        }
    }

    pub async fn create(&self, config: ProxyConfig) -> Result<(), GatewayError> {
        let mut proxies = self.inner.proxies.write().await;
        if proxies.contains_key(&config.name) {
            return Err(GatewayError::Config(format!(
                "proxy '{}' already exists",
                config.name
            )));
        }
        info!(proxy = %config.name, backend = %config.backend_name, "proxy created");
        proxies.insert(
            config.name.clone(),
            Proxy {
                config,
                state: ProxyState::Stopped,
                last_error: None,
                effective_tools: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn update(&self, name: &str, config: ProxyConfig) -> Result<(), GatewayError> {
        let mut proxies = self.inner.proxies.write().await;
        if !proxies.contains_key(name) {
            return Err(GatewayError::UnknownProxy(name.to_string()));
        }
        proxies.remove(name);
        info!(proxy = %name, new_name = %config.name, "proxy updated");
        proxies.insert(
            config.name.clone(),
            Proxy {
                config,
                state: ProxyState::Stopped,
                last_error: None,
                effective_tools: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), GatewayError> {
        let mut proxies = self.inner.proxies.write().await;
        proxies
            .remove(name)
            .ok_or_else(|| GatewayError::UnknownProxy(name.to_string()))?;
        info!(proxy = %name, "proxy deleted");
        Ok(())
    }

    /// Start a proxy. Requires its backend to be Verified.
    pub async fn start(&self, name: &str) -> Result<(), GatewayError> {
        let backend_name = {
            let proxies = self.inner.proxies.read().await;
            let proxy = proxies
                .get(name)
                .ok_or_else(|| GatewayError::UnknownProxy(name.to_string()))?;
            proxy.config.backend_name.clone()
        };

        let backend_state = self.inner.registry.state(&backend_name).await;
        if backend_state != Some(BackendState::Verified) {
            let err = GatewayError::Proxy(format!(
                "backend '{}' is {} (verified required to start proxy '{}')",
                backend_name,
                backend_state.map(|s| s.to_string()).unwrap_or_else(|| "missing".to_string()),
                name,
            ));
            let mut proxies = self.inner.proxies.write().await;
            if let Some(proxy) = proxies.get_mut(name) {
                proxy.state = ProxyState::Error;
                proxy.last_error = Some(err.to_string());
            }
            return Err(err);
        }

        self.refresh_tools(name).await?;
        let mut proxies = self.inner.proxies.write().await;
        if let Some(proxy) = proxies.get_mut(name) {
            proxy.state = ProxyState::Running;
            proxy.last_error = None;
            info!(proxy = %name, tools = proxy.effective_tools.len(), "proxy running");
        }
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), GatewayError> {
        let mut proxies = self.inner.proxies.write().await;
        let proxy = proxies
            .get_mut(name)
            .ok_or_else(|| GatewayError::UnknownProxy(name.to_string()))?;
        proxy.state = ProxyState::Stopped;
        proxy.last_error = None;
        info!(proxy = %name, "proxy stopped");
        Ok(())
    }

    /// Start every `auto_start` proxy whose backend reached Verified.
    pub async fn auto_start(&self) -> (usize, usize) {
        let names: Vec<String> = {
            let proxies = self.inner.proxies.read().await;
            proxies
                .values()
                .filter(|p| p.config.auto_start)
                .map(|p| p.config.name.clone())
                .collect()
        };
        let mut started = 0;
        let mut failed = 0;
        for name in names {
            match self.start(&name).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(proxy = %name, error = %e, "proxy auto-start failed");
                    failed += 1;
                }
            }
        }
        (started, failed)
    }

    /// Recompute a proxy's effective tool list from its backend's catalog.
    pub async fn refresh_tools(&self, name: &str) -> Result<usize, GatewayError> {
        let (backend_name, exposed) = {
            let proxies = self.inner.proxies.read().await;
            let proxy = proxies
                .get(name)
                .ok_or_else(|| GatewayError::UnknownProxy(name.to_string()))?;
            (
                proxy.config.backend_name.clone(),
                proxy.config.exposed_tools.clone(),
            )
        };

        let tools = self.inner.registry.tools_of(&backend_name).await;
        let effective: Vec<ToolDef> = if exposed.is_empty() {
            tools
        } else {
            tools
                .into_iter()
                .filter(|t| exposed.iter().any(|e| e == &t.name))
                .collect()
        };

        let count = effective.len();
        let mut proxies = self.inner.proxies.write().await;
        if let Some(proxy) = proxies.get_mut(name) {
            proxy.effective_tools = effective;
        }
        debug!(proxy = %name, tools = count, "effective tool list refreshed");
        Ok(count)
    }

    /// Keep effective tool lists fresh: whenever a backend (re-)verifies,
    /// refresh every proxy bound to it, and recover auto-start proxies
    /// whose backend verified after the startup pass (deferred retries).
    pub fn spawn_refresh_task(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let mut verified = self.inner.registry.subscribe_verified();
        tokio::spawn(async move {
            loop {
                let backend = match verified.recv().await {
                    Ok(name) => name,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let affected: Vec<(String, ProxyState, bool)> = {
                    let proxies = engine.inner.proxies.read().await;
                    proxies
                        .values()
                        .filter(|p| p.config.backend_name == backend)
                        .map(|p| (p.config.name.clone(), p.state, p.config.auto_start))
                        .collect()
                };
                for (name, state, auto_start) in affected {
                    let outcome = if state != ProxyState::Running && auto_start {
                        engine.start(&name).await.map(|_| 0)
                    } else {
                        engine.refresh_tools(&name).await
                    };
                    if let Err(e) = outcome {
                        warn!(proxy = %name, error = %e, "refresh after verification failed");
                    }
                }
            }
        })
    }

    // --------------------------------------------------------
    // Resolution & observability
    // --------------------------------------------------------

    /// Resolve an ingress path (`{proxy}{endpoint}`) to a proxy name:
    /// exact name on the first segment, else match on the configured
    /// endpoint path.
    pub async fn resolve(&self, path: &str) -> Option<String> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let first = trimmed.split('/').next().unwrap_or(trimmed);
        let rest = trimmed.strip_prefix(first).unwrap_or("").trim_start_matches('/');

        let proxies = self.inner.proxies.read().await;
        if proxies.contains_key(first) {
            return Some(first.to_string());
        }
        proxies
            .values()
            .find(|p| {
                let endpoint = p.config.endpoint.trim_matches('/');
                endpoint == trimmed || (!rest.is_empty() && endpoint == rest)
            })
            .map(|p| p.config.name.clone())
    }

    pub async fn transport_of(&self, name: &str) -> Option<ProxyTransport> {
        let proxies = self.inner.proxies.read().await;
        proxies.get(name).map(|p| p.config.transport)
    }

    pub async fn backend_of(&self, name: &str) -> Option<String> {
        let proxies = self.inner.proxies.read().await;
        proxies.get(name).map(|p| p.config.backend_name.clone())
    }

    /// How long the proxy's backend has been outside Verified.
    pub async fn backend_not_verified_for(&self, name: &str) -> Option<Duration> {
        let backend = self.backend_of(name).await?;
        self.inner.registry.not_verified_for(&backend).await
    }

    pub async fn snapshot(&self, name: &str) -> Option<ProxySnapshot> {
        let proxies = self.inner.proxies.read().await;
        proxies.get(name).map(snapshot_of)
    }

    pub async fn snapshot_all(&self) -> Vec<ProxySnapshot> {
        let proxies = self.inner.proxies.read().await;
        let mut all: Vec<ProxySnapshot> = proxies.values().map(snapshot_of).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // --------------------------------------------------------
    // Request handling
    // --------------------------------------------------------

    /// Route one JSON-RPC message. `Ok(None)` means the message was a
    /// notification with nothing to send back. Backend failures on
    /// forwarded calls come back as error envelopes, not `Err`.
    pub async fn handle(
        &self,
        proxy_name: &str,
        msg: &JsonRpcMessage,
    ) -> Result<Option<JsonRpcMessage>, GatewayError> {
        msg.validate()?;
        let method = msg
            .method
            .as_deref()
            .ok_or_else(|| GatewayError::Protocol("message has no method".to_string()))?;

        let (backend_name, exposed, state, effective_tools) = {
            let proxies = self.inner.proxies.read().await;
            let proxy = proxies
                .get(proxy_name)
                .ok_or_else(|| GatewayError::UnknownProxy(proxy_name.to_string()))?;
            (
                proxy.config.backend_name.clone(),
                proxy.config.exposed_tools.clone(),
                proxy.state,
                proxy.effective_tools.clone(),
            )
        };

        if state != ProxyState::Running {
            return Err(GatewayError::Proxy(format!(
                "proxy '{proxy_name}' is {state}"
            )));
        }
        if self.inner.registry.state(&backend_name).await != Some(BackendState::Verified) {
            return Err(GatewayError::Proxy(format!(
                "backend '{backend_name}' is not verified"
            )));
        }

        if let Some(rest) = method.strip_prefix("notifications/") {
            debug!(proxy = %proxy_name, notification = rest, "forwarding notification");
            self.inner
                .registry
                .notify(&backend_name, method, msg.params.clone())
                .await?;
            return Ok(None);
        }

        let id = msg.id.clone();
        let response = match method {
            "initialize" => self.handle_initialize(proxy_name, &backend_name, msg).await,
            "tools/list" => JsonRpcMessage::response(
                id,
                json!({
                    "tools": effective_tools,
                    // Strict validators reject a null cursor.
                    "nextCursor": "",
                }),
            ),
            "tools/call" => {
                let tool = msg
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !exposed.is_empty() && !exposed.iter().any(|e| e == tool) {
                    debug!(proxy = %proxy_name, tool, "rejecting call to unexposed tool");
                    JsonRpcMessage::error_response(
                        id,
                        codes::METHOD_NOT_FOUND,
                        format!("Method not found (tool not exposed): {tool}"),
                    )
                } else {
                    self.forward(&backend_name, msg).await
                }
            }
            "resources/list" => {
                self.resources_or_synthesized(&backend_name, msg, json!({"resources": []}))
                    .await
            }
            "resources/templates/list" => {
                self.resources_or_synthesized(&backend_name, msg, json!({"resourceTemplates": []}))
                    .await
            }
            _ => self.forward(&backend_name, msg).await,
        };

        Ok(Some(response))
    }

    async fn handle_initialize(
        &self,
        proxy_name: &str,
        backend_name: &str,
        msg: &JsonRpcMessage,
    ) -> JsonRpcMessage {
        let requested = msg
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let handshake = self.inner.registry.handshake_of(backend_name).await;

        let version = echo_version(requested)
            .map(str::to_string)
            .or_else(|| {
                handshake
                    .as_ref()
                    .map(|h| h.protocol_version.clone())
                    .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(&v.as_str()))
            })
            .unwrap_or_else(|| PROTOCOL_VERSION_PRIMARY.to_string());

        // Backend capabilities overlaid on the gateway baseline.
        let mut capabilities = handshake
            .as_ref()
            .map(|h| h.capabilities.clone())
            .unwrap_or_else(|| json!({}));
        if let Some(caps) = capabilities.as_object_mut() {
            caps.entry("tools")
                .or_insert_with(|| json!({"listChanged": true}));
            caps.entry("logging").or_insert_with(|| json!({}));
        }

        let instructions = self.effective_instructions(proxy_name, backend_name).await;

        let mut result = json!({
            "protocolVersion": version,
            "capabilities": capabilities,
            "serverInfo": {
                "name": format!("{}-{}", self.inner.gateway_name, proxy_name),
                "version": self.inner.gateway_version,
            },
        });
        if let Some(text) = instructions {
            result["instructions"] = Value::String(text);
        }

        JsonRpcMessage::response(msg.id.clone(), normalize_initialize_result(result))
    }

    /// Instructions priority: proxy override, then the backend's effective
    /// instructions, then nothing at all.
    async fn effective_instructions(&self, proxy_name: &str, backend_name: &str) -> Option<String> {
        let override_text = {
            let proxies = self.inner.proxies.read().await;
            proxies
                .get(proxy_name)
                .and_then(|p| p.config.instructions_override.clone())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        if override_text.is_some() {
            return override_text;
        }
        self.inner.registry.instructions_of(backend_name).await
    }

    /// Forward resource listings only when the backend says it serves
    /// resources; otherwise keep probing clients happy with an empty,
    /// schema-valid result.
    async fn resources_or_synthesized(
        &self,
        backend_name: &str,
        msg: &JsonRpcMessage,
        empty: Value,
    ) -> JsonRpcMessage {
        let advertises_resources = self
            .inner
            .registry
            .handshake_of(backend_name)
            .await
            .map(|h| h.has_capability("resources"))
            .unwrap_or(false);
        if advertises_resources {
            self.forward(backend_name, msg).await
        } else {
            JsonRpcMessage::response(msg.id.clone(), empty)
        }
    }

    async fn forward(&self, backend_name: &str, msg: &JsonRpcMessage) -> JsonRpcMessage {
        let method = msg.method.as_deref().unwrap_or_default();
        match self
            .inner
            .registry
            .call(backend_name, method, msg.params.clone(), FORWARD_TIMEOUT)
            .await
        {
            Ok(result) => JsonRpcMessage::response(msg.id.clone(), result),
            Err(e) => {
                debug!(backend = %backend_name, method, error = %e, "forwarded call failed");
                JsonRpcMessage::from_gateway_error(msg.id.clone(), &e)
            }
        }
    }
}

fn snapshot_of(proxy: &Proxy) -> ProxySnapshot {
    ProxySnapshot {
        name: proxy.config.name.clone(),
        backend_name: proxy.config.backend_name.clone(),
        endpoint: proxy.config.endpoint.clone(),
        transport: proxy.config.transport,
        state: proxy.state,
        auto_start: proxy.config.auto_start,
        last_error: proxy.last_error.clone(),
        exposed_tools: proxy.config.exposed_tools.clone(),
        tool_count: proxy.effective_tools.len(),
        tools: proxy.effective_tools.clone(),
    }
}

// ============================================================
// Tests
// ============================================================
