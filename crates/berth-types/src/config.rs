/// Configuration types for the berth gateway.
///
/// Serde aliases accept the legacy camelCase field names found in imported
/// documents; everything is written back in canonical snake_case.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Transport a backend (or proxy) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child-process byte stream: newline-delimited JSON-RPC on stdin/stdout.
    #[serde(alias = "stdio")]
    Local,
    /// Server-push event stream with a companion POST channel.
    #[serde(alias = "sse")]
    Event,
    /// Request/response HTTP JSON-RPC, optionally with SSE-framed replies.
    #[serde(alias = "streamableHTTP", alias = "streamable_http")]
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Event => write!(f, "event"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// Persistent descriptor of a backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique identifier, stable across restarts. Filled from the document
    /// key when absent in the entry itself.
    #[serde(default)]
    pub name: String,
    #[serde(alias = "transportType", alias = "transport_type")]
    pub transport: TransportKind,
    /// LOCAL: executable to spawn.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// LOCAL: ordered command-line arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// LOCAL: environment variables for the child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// LOCAL: working directory for the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// EVENT/HTTP: endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// EVENT/HTTP: extra request headers (bearer auth etc.).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
    /// Operator-provided usage instructions, overriding what the backend
    /// reports in its handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Backends that must be started (and settle) before this one.
    #[serde(default, alias = "dependsOn", skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// EVENT: also probe `url + "/mcp/sse"` when the configured URL fails,
    /// for servers predating the canonical endpoint layout.
    #[serde(default = "default_true", alias = "legacySseProbe")]
    pub legacy_sse_probe: bool,
}

fn default_true() -> bool {
    true
}

/// Transport a proxy exposes to clients. LOCAL is not exposable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTransport {
    #[serde(alias = "sse")]
    Event,
    #[serde(alias = "streamableHTTP", alias = "streamable_http")]
    Http,
}

/// Persistent descriptor of an exposed proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub name: String,
    #[serde(alias = "backendName", alias = "serverName", alias = "server_name")]
    pub backend_name: String,
    /// URL path the proxy is mounted at, beginning with `/`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(alias = "transportType", alias = "transport_type")]
    pub transport: ProxyTransport,
    /// Tool names to expose; empty means all backend tools.
    #[serde(default, alias = "exposedTools", skip_serializing_if = "Vec::is_empty")]
    pub exposed_tools: Vec<String>,
    #[serde(
        default,
        alias = "instructionsOverride",
        alias = "instructions",
        skip_serializing_if = "Option::is_none"
    )]
    pub instructions_override: Option<String>,
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
}

fn default_endpoint() -> String {
    "/mcp".to_string()
}

// ============================================================
// Runtime tuning
// ============================================================

/// Admission-control limits. Adjustable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_sessions_per_client")]
    pub max_sessions_per_client: usize,
    #[serde(default = "default_max_sessions_per_proxy")]
    pub max_sessions_per_proxy: usize,
    /// Rolling window for session-creation rate checks, in seconds.
    #[serde(default = "default_creation_window")]
    pub creation_window_seconds: u64,
    /// Creations allowed above the per-client cap within the window.
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: usize,
}

fn default_max_sessions_per_client() -> usize {
    10
}
fn default_max_sessions_per_proxy() -> usize {
    50
}
fn default_creation_window() -> u64 {
    60
}
fn default_burst_allowance() -> usize {
    3
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_client: default_max_sessions_per_client(),
            max_sessions_per_proxy: default_max_sessions_per_proxy(),
            creation_window_seconds: default_creation_window(),
            burst_allowance: default_burst_allowance(),
        }
    }
}

/// Heartbeat cadence and adaptation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_hb_initial")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_hb_min")]
    pub min_interval_secs: u64,
    #[serde(default = "default_hb_max")]
    pub max_interval_secs: u64,
    /// Adaptation is evaluated once per this many ticks.
    #[serde(default = "default_hb_eval_ticks")]
    pub evaluation_ticks: u32,
    /// Error rate above which the interval grows.
    #[serde(default = "default_hb_grow_threshold")]
    pub grow_error_rate: f64,
    /// Error rate below which the interval may shrink.
    #[serde(default = "default_hb_shrink_threshold")]
    pub shrink_error_rate: f64,
    /// Mean delivery time below which the interval may shrink, in ms.
    #[serde(default = "default_hb_shrink_rtt")]
    pub shrink_rtt_ms: f64,
    /// Consecutive send failures before a session is considered unhealthy.
    #[serde(default = "default_hb_max_failures")]
    pub max_consecutive_failures: u32,
    /// Sliding window size for delivery-time samples.
    #[serde(default = "default_hb_rtt_window")]
    pub rtt_window: usize,
}

fn default_hb_initial() -> u64 {
    10
}
fn default_hb_min() -> u64 {
    5
}
fn default_hb_max() -> u64 {
    30
}
fn default_hb_eval_ticks() -> u32 {
    6
}
fn default_hb_grow_threshold() -> f64 {
    0.20
}
fn default_hb_shrink_threshold() -> f64 {
    0.02
}
fn default_hb_shrink_rtt() -> f64 {
    200.0
}
fn default_hb_max_failures() -> u32 {
    3
}
fn default_hb_rtt_window() -> usize {
    64
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: default_hb_initial(),
            min_interval_secs: default_hb_min(),
            max_interval_secs: default_hb_max(),
            evaluation_ticks: default_hb_eval_ticks(),
            grow_error_rate: default_hb_grow_threshold(),
            shrink_error_rate: default_hb_shrink_threshold(),
            shrink_rtt_ms: default_hb_shrink_rtt(),
            max_consecutive_failures: default_hb_max_failures(),
            rtt_window: default_hb_rtt_window(),
        }
    }
}

/// Session lifecycle bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Pending-queue bound; overflowing it closes the session.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    /// Sessions that never initialize are reaped after this long.
    #[serde(default = "default_init_deadline")]
    pub init_deadline_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// Grace period for sessions whose backend left Verified.
    #[serde(default = "default_backend_grace")]
    pub backend_grace_secs: u64,
    /// Close must settle all session tasks within this bound.
    #[serde(default = "default_cancel_deadline")]
    pub cancel_deadline_secs: u64,
}

fn default_max_queue() -> usize {
    1024
}
fn default_idle_ttl() -> u64 {
    300
}
fn default_init_deadline() -> u64 {
    30
}
fn default_reap_interval() -> u64 {
    60
}
fn default_backend_grace() -> u64 {
    30
}
fn default_cancel_deadline() -> u64 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            idle_ttl_secs: default_idle_ttl(),
            init_deadline_secs: default_init_deadline(),
            reap_interval_secs: default_reap_interval(),
            backend_grace_secs: default_backend_grace(),
            cancel_deadline_secs: default_cancel_deadline(),
        }
    }
}

/// Top-level runtime tuning document (`gateway.json`); every section is
/// optional and defaults apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_accepts_legacy_casing() {
        let cfg: BackendConfig = serde_json::from_str(
            r#"{
                "transportType": "streamableHTTP",
                "url": "https://mcp.example.com",
                "autoStart": true,
                "dependsOn": ["auth"]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.transport, TransportKind::Http);
        assert!(cfg.auto_start);
        assert!(cfg.depends_on.contains("auth"));
        assert!(cfg.legacy_sse_probe);
    }

    #[test]
    fn test_backend_config_accepts_stdio_alias() {
        let cfg: BackendConfig = serde_json::from_str(
            r#"{"transport": "stdio", "command": "mcp-server", "args": ["--fast"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.transport, TransportKind::Local);
        assert_eq!(cfg.args, vec!["--fast"]);
    }

    #[test]
    fn test_backend_config_canonical_roundtrip() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"transport": "event", "url": "http://x", "auto_start": true}"#)
                .unwrap();
        let wire = serde_json::to_value(&cfg).unwrap();
        assert_eq!(wire["transport"], "event");
        assert_eq!(wire["auto_start"], true);
        assert!(wire.get("command").is_none());
    }

    #[test]
    fn test_proxy_config_aliases_and_defaults() {
        let cfg: ProxyConfig = serde_json::from_str(
            r#"{"serverName": "notion", "transport": "sse", "exposedTools": ["search"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.backend_name, "notion");
        assert_eq!(cfg.endpoint, "/mcp");
        assert_eq!(cfg.transport, ProxyTransport::Event);
        assert_eq!(cfg.exposed_tools, vec!["search"]);
    }

    #[test]
    fn test_gateway_config_defaults() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rate_limit.max_sessions_per_client, 10);
        assert_eq!(cfg.rate_limit.max_sessions_per_proxy, 50);
        assert_eq!(cfg.heartbeat.initial_interval_secs, 10);
        assert_eq!(cfg.session.max_queue, 1024);
    }
}
