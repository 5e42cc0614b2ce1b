/// Unified error type for the berth gateway.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed configuration, unknown referenced backend, dependency cycle.
    #[error("config error: {0}")]
    Config(String),

    /// Transport could not reach the peer (spawn, DNS, TCP, TLS).
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Malformed frame or message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection or the child process exited.
    #[error("peer closed: {0}")]
    PeerClosed(String),

    /// A deadline elapsed waiting for the peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer replied with a JSON-RPC error envelope.
    #[error("peer error {code}: {message}")]
    Peer {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Handshake rejected, tool listing rejected, or other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Proxy not running, backend not verified, method or tool not exposed.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The referenced proxy does not exist.
    #[error("unknown proxy: {0}")]
    UnknownProxy(String),

    /// The referenced session does not exist.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The session's pending queue reached its bound.
    #[error("queue overflow: {0}")]
    QueueOverflow(String),

    /// Admission control rejected a new session.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// Other session-level failure.
    #[error("session error: {0}")]
    Session(String),

    /// A message failed normalization beyond repair.
    #[error("compliance error: {0}")]
    Compliance(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_connect() {
            GatewayError::ConnectFailed(err.to_string())
        } else {
            GatewayError::Backend(err.to_string())
        }
    }
}

impl GatewayError {
    /// JSON-RPC error code to use when this error crosses the wire.
    pub fn jsonrpc_code(&self) -> i64 {
        use crate::messages::codes;
        match self {
            GatewayError::Peer { code, .. } => *code,
            GatewayError::Proxy(_) | GatewayError::UnknownProxy(_) => codes::SERVER_ERROR,
            GatewayError::Config(_) => codes::INVALID_REQUEST,
            GatewayError::Protocol(_) | GatewayError::Serialization(_) => codes::PARSE_ERROR,
            GatewayError::Timeout(_) => codes::SERVER_ERROR - 1,
            GatewayError::ConnectFailed(_) | GatewayError::PeerClosed(_) => codes::SERVER_ERROR - 2,
            GatewayError::UnknownSession(_) => codes::SERVER_ERROR - 3,
            GatewayError::QueueOverflow(_) => codes::SERVER_ERROR - 4,
            GatewayError::AdmissionRejected(_) => codes::SERVER_ERROR - 5,
            _ => codes::INTERNAL_ERROR,
        }
    }
}
