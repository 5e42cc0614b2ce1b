//! Backend records, state machine, and verification.
//!
//! The registry map is the hot path for tool-catalog reads, so it sits
//! behind a readers-writer lock; state transitions go through the write
//! half and are therefore serialized. Each backend has at most one live
//! client handle at any moment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use berth_transport::retry::retry_with_backoff;
use berth_types::store::validate_backend;
use berth_types::{
    BackendConfig, GatewayError, HandshakeResult, ToolDef, TransportClient, TransportKind,
    SUPPORTED_PROTOCOL_VERSIONS,
};

/// Total deadline for the MCP handshake against one endpoint candidate.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Total deadline for one tool-catalog fetch.
const TOOL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay before the deferred retry when the catalog fetch fails at start.
const TOOL_RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================
// State machine
// ============================================================

/// Backend lifecycle states.
///
/// ```text
/// Stopped → Starting → Running → Verified → {Running, Error, Stopped}
/// ```
///
/// Verified means the handshake completed and the tool catalog was fetched
/// at least once; only Verified backends serve proxy traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Stopped,
    Starting,
    Running,
    Verified,
    Error,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Stopped => write!(f, "stopped"),
            BackendState::Starting => write!(f, "starting"),
            BackendState::Running => write!(f, "running"),
            BackendState::Verified => write!(f, "verified"),
            BackendState::Error => write!(f, "error"),
        }
    }
}

/// A live backend record bound to its configuration.
pub struct Backend {
    pub config: BackendConfig,
    pub state: BackendState,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub handshake: Option<HandshakeResult>,
    pub tools: Vec<ToolDef>,
    state_entered_at: Instant,
    client: Option<Arc<dyn TransportClient>>,
    cancel: CancellationToken,
}

impl Backend {
    fn new(config: BackendConfig) -> Self {
        Self {
            config,
            state: BackendState::Stopped,
            last_error: None,
            started_at: None,
            handshake: None,
            tools: Vec::new(),
            state_entered_at: Instant::now(),
            client: None,
            cancel: CancellationToken::new(),
        }
    }

    fn enter(&mut self, state: BackendState) {
        if self.state != state {
            self.state = state;
            self.state_entered_at = Instant::now();
        }
    }
}

/// Immutable, serializable view of a backend for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub state: BackendState,
    pub transport: TransportKind,
    pub auto_start: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub protocol_version: Option<String>,
    pub server_info: Option<serde_json::Value>,
    pub tool_count: usize,
    pub tools: Vec<ToolDef>,
}

// ============================================================
// Registry
// ============================================================

struct RegistryInner {
    backends: RwLock<HashMap<String, Backend>>,
    verified_tx: broadcast::Sender<String>,
    client_name: String,
    client_version: String,
}

/// Owns all backend records; cheap to clone and share.
#[derive(Clone)]
pub struct BackendRegistry {
    inner: Arc<RegistryInner>,
}

impl BackendRegistry {
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        let (verified_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                backends: RwLock::new(HashMap::new()),
                verified_tx,
                client_name: client_name.into(),
                client_version: client_version.into(),
            }),
        }
    }

    /// Seed records for every configured backend, all Stopped.
    pub async fn load(&self, configs: impl IntoIterator<Item = BackendConfig>) {
        let mut backends = self.inner.backends.write().await;
        for config in configs {
            backends
                .entry(config.name.clone())
                .or_insert_with(|| Backend::new(config));
        }
    }

    /// Notifies subscribers with the backend name each time a backend
    /// (re-)reaches Verified.
    pub fn subscribe_verified(&self) -> broadcast::Receiver<String> {
        self.inner.verified_tx.subscribe()
    }

    pub async fn create(&self, config: BackendConfig) -> Result<(), GatewayError> {
        validate_backend(&config)?;
        let mut backends = self.inner.backends.write().await;
        if backends.contains_key(&config.name) {
            return Err(GatewayError::Config(format!(
                "backend '{}' already exists",
                config.name
            )));
        }
        info!(backend = %config.name, transport = %config.transport, "backend created");
        backends.insert(config.name.clone(), Backend::new(config));
        Ok(())
    }

    /// Replace a backend's configuration. A running backend is stopped
    /// first; the caller decides whether to start the new one.
    pub async fn update(&self, name: &str, config: BackendConfig) -> Result<(), GatewayError> {
        validate_backend(&config)?;
        self.stop(name).await?;
        let mut backends = self.inner.backends.write().await;
        if !backends.contains_key(name) {
            return Err(GatewayError::Backend(format!("unknown backend: {name}")));
        }
        backends.remove(name);
        info!(backend = %name, new_name = %config.name, "backend updated");
        backends.insert(config.name.clone(), Backend::new(config));
        Ok(())
    }

    /// Delete implies stop.
    pub async fn delete(&self, name: &str) -> Result<(), GatewayError> {
        self.stop(name).await?;
        let mut backends = self.inner.backends.write().await;
        backends
            .remove(name)
            .ok_or_else(|| GatewayError::Backend(format!("unknown backend: {name}")))?;
        info!(backend = %name, "backend deleted");
        Ok(())
    }

    /// Spawn/connect, handshake, and fetch the tool catalog.
    ///
    /// Idempotent: a backend already Running or Verified is left untouched.
    /// Handshake success with a failed catalog fetch leaves the backend
    /// Running with `last_error` set and a deferred retry scheduled.
    pub async fn start(&self, name: &str) -> Result<(), GatewayError> {
        let (config, cancel) = {
            let mut backends = self.inner.backends.write().await;
            let backend = backends
                .get_mut(name)
                .ok_or_else(|| GatewayError::Backend(format!("unknown backend: {name}")))?;
            match backend.state {
                BackendState::Running | BackendState::Verified | BackendState::Starting => {
                    debug!(backend = %name, state = %backend.state, "start is a no-op");
                    return Ok(());
                }
                BackendState::Stopped | BackendState::Error => {}
            }
            backend.enter(BackendState::Starting);
            backend.last_error = None;
            backend.cancel = CancellationToken::new();
            (backend.config.clone(), backend.cancel.clone())
        };

        let connected = self.connect_and_handshake(&config, cancel).await;
        let (client, handshake) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                self.record_failure(name, BackendState::Error, &e).await;
                return Err(e);
            }
        };

        info!(
            backend = %name,
            protocol_version = %handshake.protocol_version,
            "backend handshake complete"
        );

        {
            let mut backends = self.inner.backends.write().await;
            let Some(backend) = backends.get_mut(name) else {
                let _ = client.close().await;
                return Err(GatewayError::Backend(format!(
                    "backend '{name}' was deleted during start"
                )));
            };
            backend.client = Some(client);
            backend.handshake = Some(handshake);
            backend.started_at = Some(Utc::now());
            backend.enter(BackendState::Running);
        }

        match self.verify(name).await {
            Ok(count) => {
                debug!(backend = %name, tools = count, "backend verified at start");
                Ok(())
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "tool fetch failed at start, retry scheduled");
                let registry = self.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(TOOL_RETRY_DELAY).await;
                    match registry.verify(&name).await {
                        Ok(count) => {
                            info!(backend = %name, tools = count, "deferred verification succeeded")
                        }
                        Err(e) => {
                            error!(backend = %name, error = %e, "deferred verification failed")
                        }
                    }
                });
                // Handshake succeeded, so the backend stays Running.
                Ok(())
            }
        }
    }

    /// Close the client handle and transition to Stopped. For LOCAL
    /// backends this terminates the child process tree.
    pub async fn stop(&self, name: &str) -> Result<(), GatewayError> {
        let (client, cancel) = {
            let mut backends = self.inner.backends.write().await;
            let backend = backends
                .get_mut(name)
                .ok_or_else(|| GatewayError::Backend(format!("unknown backend: {name}")))?;
            backend.enter(BackendState::Stopped);
            backend.last_error = None;
            (backend.client.take(), backend.cancel.clone())
        };
        cancel.cancel();
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                warn!(backend = %name, error = %e, "error closing backend client");
            }
            info!(backend = %name, "backend stopped");
        }
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), GatewayError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Re-run the tool-catalog fetch and broadcast to subscribers.
    ///
    /// Returns the number of tools on success. An empty catalog is a
    /// verification failure: Verified backends always publish tools.
    pub async fn verify(&self, name: &str) -> Result<usize, GatewayError> {
        let client = self.client_for(name, false).await?;

        let fetched = tokio::time::timeout(
            TOOL_FETCH_TIMEOUT,
            retry_with_backoff(1, Duration::from_secs(1), || client.list_tools()),
        )
        .await
        .map_err(|_| {
            GatewayError::Timeout(format!(
                "tool fetch timed out after {TOOL_FETCH_TIMEOUT:?} (backend={name})"
            ))
        })
        .and_then(|r| r);

        match fetched {
            Ok(tools) if tools.is_empty() => {
                let err = GatewayError::Backend(format!("backend '{name}' returned no tools"));
                self.record_failure(name, BackendState::Running, &err).await;
                Err(err)
            }
            Ok(tools) => {
                let count = tools.len();
                {
                    let mut backends = self.inner.backends.write().await;
                    if let Some(backend) = backends.get_mut(name) {
                        backend.tools = tools;
                        backend.last_error = None;
                        backend.enter(BackendState::Verified);
                    }
                }
                info!(backend = %name, tools = count, "backend verified");
                let _ = self.inner.verified_tx.send(name.to_string());
                Ok(count)
            }
            Err(e) => {
                self.record_failure(name, BackendState::Running, &e).await;
                Err(e)
            }
        }
    }

    /// Forward a request to a backend. `tools/*` requires Verified; other
    /// methods are allowed from Running (handshake retries and probes).
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, GatewayError> {
        let require_verified = method.starts_with("tools/");
        let client = self.client_for(name, require_verified).await?;
        tokio::time::timeout(deadline, client.call(method, params))
            .await
            .map_err(|_| {
                GatewayError::Timeout(format!(
                    "request {method} timed out after {deadline:?} (backend={name})"
                ))
            })?
    }

    pub async fn notify(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let client = self.client_for(name, false).await?;
        client.notify(method, params).await
    }

    /// Subscribe to a backend's server-originated message stream.
    pub async fn subscribe(
        &self,
        name: &str,
    ) -> Result<Option<broadcast::Receiver<berth_types::JsonRpcMessage>>, GatewayError> {
        let client = self.client_for(name, false).await?;
        Ok(client.subscribe())
    }

    pub async fn state(&self, name: &str) -> Option<BackendState> {
        self.inner.backends.read().await.get(name).map(|b| b.state)
    }

    /// How long the backend has been outside Verified; `None` while
    /// Verified or unknown.
    pub async fn not_verified_for(&self, name: &str) -> Option<Duration> {
        let backends = self.inner.backends.read().await;
        let backend = backends.get(name)?;
        match backend.state {
            BackendState::Verified => None,
            _ => Some(backend.state_entered_at.elapsed()),
        }
    }

    pub async fn handshake_of(&self, name: &str) -> Option<HandshakeResult> {
        self.inner
            .backends
            .read()
            .await
            .get(name)
            .and_then(|b| b.handshake.clone())
    }

    pub async fn tools_of(&self, name: &str) -> Vec<ToolDef> {
        self.inner
            .backends
            .read()
            .await
            .get(name)
            .map(|b| b.tools.clone())
            .unwrap_or_default()
    }

    /// Effective backend instructions: the config-level override wins over
    /// what the backend reported in its handshake.
    pub async fn instructions_of(&self, name: &str) -> Option<String> {
        let backends = self.inner.backends.read().await;
        let backend = backends.get(name)?;
        backend
            .config
            .instructions
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| backend.handshake.as_ref().and_then(|h| h.instructions.clone()))
            .filter(|s| !s.trim().is_empty())
    }

    pub async fn snapshot(&self, name: &str) -> Option<BackendSnapshot> {
        let backends = self.inner.backends.read().await;
        backends.get(name).map(snapshot_of)
    }

    pub async fn snapshot_all(&self) -> Vec<BackendSnapshot> {
        let backends = self.inner.backends.read().await;
        let mut all: Vec<BackendSnapshot> = backends.values().map(snapshot_of).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner.backends.read().await.keys().cloned().collect()
    }

    // --------------------------------------------------------
    // Internals
    // --------------------------------------------------------

    async fn client_for(
        &self,
        name: &str,
        require_verified: bool,
    ) -> Result<Arc<dyn TransportClient>, GatewayError> {
        let backends = self.inner.backends.read().await;
        let backend = backends
            .get(name)
            .ok_or_else(|| GatewayError::Backend(format!("unknown backend: {name}")))?;
        if !matches!(backend.state, BackendState::Running | BackendState::Verified) {
            return Err(GatewayError::Backend(format!(
                "backend '{name}' is {}, not serving",
                backend.state
            )));
        }
        if require_verified && backend.state != BackendState::Verified {
            return Err(GatewayError::Proxy(format!(
                "backend '{name}' is {} (verified required)",
                backend.state
            )));
        }
        backend
            .client
            .clone()
            .ok_or_else(|| GatewayError::Backend(format!("backend '{name}' has no live client")))
    }

    /// Connect and complete the handshake, probing endpoint candidates in
    /// order for EVENT backends. Earlier candidates' errors surface only
    /// when every candidate fails.
    async fn connect_and_handshake(
        &self,
        config: &BackendConfig,
        cancel: CancellationToken,
    ) -> Result<(Arc<dyn TransportClient>, HandshakeResult), GatewayError> {
        let candidates: Vec<Option<String>> = match (config.transport, config.url.as_deref()) {
            (TransportKind::Event, Some(url)) => {
                let mut list = vec![Some(url.to_string())];
                if config.legacy_sse_probe && !url.ends_with("/mcp/sse") {
                    list.push(Some(format!("{}/mcp/sse", url.trim_end_matches('/'))));
                }
                list
            }
            _ => vec![None],
        };

        let mut attempts = Vec::new();
        for candidate in candidates {
            let label = candidate
                .clone()
                .unwrap_or_else(|| format!("{} transport", config.transport));
            match berth_transport::connect_backend(config, candidate.as_deref(), cancel.child_token())
                .await
            {
                Ok(client) => match self.run_handshake(&client).await {
                    Ok(handshake) => return Ok((client, handshake)),
                    Err(e) => {
                        debug!(backend = %config.name, candidate = %label, error = %e, "handshake failed");
                        let _ = client.close().await;
                        attempts.push(format!("{label}: {e}"));
                    }
                },
                Err(e) => {
                    debug!(backend = %config.name, candidate = %label, error = %e, "connect failed");
                    attempts.push(format!("{label}: {e}"));
                }
            }
        }

        Err(GatewayError::ConnectFailed(format!(
            "all endpoints failed for backend '{}': {}",
            config.name,
            attempts.join("; ")
        )))
    }

    /// Try the recognized protocol revisions in preference order; whatever
    /// revision the backend answers with is accepted.
    async fn run_handshake(
        &self,
        client: &Arc<dyn TransportClient>,
    ) -> Result<HandshakeResult, GatewayError> {
        let mut last_err = None;
        for version in SUPPORTED_PROTOCOL_VERSIONS {
            let attempt = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                client.handshake(&self.inner.client_name, &self.inner.client_version, version),
            )
            .await
            .map_err(|_| {
                GatewayError::Timeout(format!("handshake timed out after {HANDSHAKE_TIMEOUT:?}"))
            })
            .and_then(|r| r);
            match attempt {
                Ok(handshake) => return Ok(handshake),
                Err(e) => {
                    debug!(version, error = %e, "handshake attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Internal("no protocol versions".to_string())))
    }

    async fn record_failure(&self, name: &str, state: BackendState, err: &GatewayError) {
        let mut backends = self.inner.backends.write().await;
        if let Some(backend) = backends.get_mut(name) {
            backend.last_error = Some(err.to_string());
            backend.enter(state);
        }
    }
}

fn snapshot_of(backend: &Backend) -> BackendSnapshot {
    BackendSnapshot {
        name: backend.config.name.clone(),
        state: backend.state,
        transport: backend.config.transport,
        auto_start: backend.config.auto_start,
        started_at: backend.started_at,
        last_error: backend.last_error.clone(),
        protocol_version: backend.handshake.as_ref().map(|h| h.protocol_version.clone()),
        server_info: backend.handshake.as_ref().map(|h| h.server_info.clone()),
        tool_count: backend.tools.len(),
        tools: backend.tools.clone(),
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A LOCAL backend implemented as a shell loop: answers initialize and
    /// tools/list well enough to reach Verified.
    fn fixture_backend(name: &str) -> BackendConfig {
        fixture_with_tools(
            name,
            r#"[{"name":"search","description":"Search things","inputSchema":{"type":"object"}},{"name":"delete_all"}]"#,
        )
    }

    fn fixture_with_tools(name: &str, tools_json: &str) -> BackendConfig {
        let script = format!(
            r#"while IFS= read -r line; do
                   id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                   case "$line" in
                       *'"initialize"'*)
                           printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"fixture","version":"1.0","instructions":"use the fixture"}}}}}}\n' "$id" ;;
                       *'"tools/list"'*)
                           printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":{tools}}}}}\n' "$id" ;;
                       *)
                           [ -n "$id" ] && printf '{{"jsonrpc":"2.0","id":%s,"result":{{"ok":true}}}}\n' "$id" ;;
                   esac
               done"#,
            tools = tools_json,
        );
        serde_json::from_value(json!({
            "name": name,
            "transport": "local",
            "command": "sh",
            "args": ["-c", script],
        }))
        .unwrap()
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new("berth", "0.1.0")
    }

    #[tokio::test]
    async fn test_start_reaches_verified_with_normalized_tools() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        registry.start("fix").await.unwrap();

        assert_eq!(registry.state("fix").await, Some(BackendState::Verified));
        let tools = registry.tools_of("fix").await;
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search");
        // delete_all had no schema; normalization supplies the default.
        assert_eq!(tools[1].input_schema, json!({"type": "object"}));

        let hs = registry.handshake_of("fix").await.unwrap();
        assert_eq!(hs.protocol_version, "2024-11-05");
        // Instructions were nested in serverInfo; normalization hoists them.
        assert_eq!(hs.instructions.as_deref(), Some("use the fixture"));

        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        registry.start("fix").await.unwrap();
        let started_at = registry.snapshot("fix").await.unwrap().started_at;

        registry.start("fix").await.unwrap();
        let snapshot = registry.snapshot("fix").await.unwrap();
        assert_eq!(snapshot.state, BackendState::Verified);
        assert_eq!(snapshot.started_at, started_at, "no respawn on redundant start");

        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_then_start_equals_restart() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        registry.start("fix").await.unwrap();

        registry.stop("fix").await.unwrap();
        assert_eq!(registry.state("fix").await, Some(BackendState::Stopped));
        registry.start("fix").await.unwrap();
        let via_stop_start = registry.snapshot("fix").await.unwrap();

        registry.restart("fix").await.unwrap();
        let via_restart = registry.snapshot("fix").await.unwrap();

        assert_eq!(via_stop_start.state, via_restart.state);
        assert_eq!(via_stop_start.tool_count, via_restart.tool_count);
        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error_state() {
        let registry = registry();
        let mut config = fixture_backend("broken");
        config.command = "no-such-binary-here".to_string();
        config.args.clear();
        registry.create(config).await.unwrap();

        let err = registry.start("broken").await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
        let snapshot = registry.snapshot("broken").await.unwrap();
        assert_eq!(snapshot.state, BackendState::Error);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn test_tools_call_refused_before_verified() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();

        let err = registry
            .call("fix", "tools/call", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));

        registry.start("fix").await.unwrap();
        let result = registry
            .call("fix", "tools/call", Some(json!({"name": "search"})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_broadcasts_to_subscribers() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        let mut events = registry.subscribe_verified();

        registry.start("fix").await.unwrap();
        let name = events.recv().await.unwrap();
        assert_eq!(name, "fix");

        registry.verify("fix").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "fix");
        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_catalog_is_not_verified() {
        let registry = registry();
        registry
            .create(fixture_with_tools("hollow", "[]"))
            .await
            .unwrap();
        // Handshake succeeds, so start itself reports success.
        registry.start("hollow").await.unwrap();
        let snapshot = registry.snapshot("hollow").await.unwrap();
        assert_eq!(snapshot.state, BackendState::Running);
        assert!(snapshot.last_error.unwrap().contains("no tools"));
        registry.stop("hollow").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let registry = registry();
        registry.create(fixture_backend("dup")).await.unwrap();
        let err = registry.create(fixture_backend("dup")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_delete_implies_stop() {
        let registry = registry();
        registry.create(fixture_backend("gone")).await.unwrap();
        registry.start("gone").await.unwrap();
        registry.delete("gone").await.unwrap();
        assert!(registry.state("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_not_verified_for_tracks_state_age() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        assert!(registry.not_verified_for("fix").await.is_some());

        registry.start("fix").await.unwrap();
        assert!(registry.not_verified_for("fix").await.is_none());

        registry.stop("fix").await.unwrap();
        assert!(registry.not_verified_for("fix").await.is_some());
    }

    #[tokio::test]
    async fn test_config_instructions_override_handshake() {
        let registry = registry();
        let mut config = fixture_backend("fix");
        config.instructions = Some("from config".to_string());
        registry.create(config).await.unwrap();
        registry.start("fix").await.unwrap();

        assert_eq!(
            registry.instructions_of("fix").await.as_deref(),
            Some("from config")
        );
        registry.stop("fix").await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_instructions_used_without_override() {
        let registry = registry();
        registry.create(fixture_backend("fix")).await.unwrap();
        registry.start("fix").await.unwrap();
        assert_eq!(
            registry.instructions_of("fix").await.as_deref(),
            Some("use the fixture")
        );
        registry.stop("fix").await.unwrap();
    }
}
