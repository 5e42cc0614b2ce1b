//! HTTP transport: one POST per JSON-RPC envelope.
//!
//! The reply body is either a single JSON envelope or an SSE-framed stream
//! of envelopes (streaming tool calls); both are tolerated. Replies that
//! do not answer the in-flight request are forwarded to subscribers.
//! A `Mcp-Session-Id` response header, when present, is echoed on
//! subsequent requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use berth_types::compliance::http_status_to_code;
use berth_types::{GatewayError, JsonRpcMessage, TransportClient};

use crate::correlate::{unwrap_reply, Correlator};
use crate::sse::SseDecoder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Streaming tools may take long; the whole-request deadline is generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct HttpClient {
    http: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    correlator: Arc<Correlator>,
    session_id: Mutex<Option<String>>,
    alive: AtomicBool,
}

impl HttpClient {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Internal(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            url: url.to_string(),
            headers: headers.clone(),
            correlator: Arc::new(Correlator::new()),
            session_id: Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }

    async fn post(&self, msg: &JsonRpcMessage) -> Result<(String, String), GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::PeerClosed("client closed".to_string()));
        }
        let mut request = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(msg);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(session) = session {
            request = request.header("Mcp-Session-Id", session);
        }

        let response = request.send().await?;
        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            debug!(session_id = session, "captured backend session id");
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Peer {
                code: http_status_to_code(status.as_u16()),
                message: format!("backend returned HTTP {status}"),
                data: None,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;
        Ok((content_type, body))
    }

    /// Pull the reply for `id` out of the response body, forwarding any
    /// other envelopes to subscribers.
    fn extract_reply(
        &self,
        id: i64,
        content_type: &str,
        body: &str,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let mut reply = None;
        if content_type.contains("text/event-stream") {
            let mut decoder = SseDecoder::new();
            let mut framed = body.to_string();
            if !framed.ends_with("\n\n") {
                framed.push_str("\n\n");
            }
            for event in decoder.push(&framed) {
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(msg) if msg.is_response() && msg.id.as_ref().and_then(Value::as_i64) == Some(id) => {
                        reply = Some(msg);
                    }
                    Ok(msg) => self.correlator.route(msg),
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable frame in reply stream");
                    }
                }
            }
        } else {
            let msg: JsonRpcMessage = serde_json::from_str(body)
                .map_err(|e| GatewayError::Protocol(format!("malformed reply body: {e}")))?;
            reply = Some(msg);
        }
        reply.ok_or_else(|| {
            GatewayError::Protocol(format!("reply stream carried no response for id {id}"))
        })
    }
}

#[async_trait]
impl TransportClient for HttpClient {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        let id = self.correlator.next_id();
        let request = JsonRpcMessage::request(Value::from(id), method, params);
        let (content_type, body) = self.post(&request).await?;
        if body.trim().is_empty() {
            return Err(GatewayError::Protocol(format!(
                "empty reply body for request {method}"
            )));
        }
        let reply = self.extract_reply(id, &content_type, &body)?;
        unwrap_reply(reply)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        let notification = JsonRpcMessage::notification(method, params);
        // Notifications commonly get an empty 2xx acknowledgement.
        self.post(&notification).await.map(|_| ())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<JsonRpcMessage>> {
        Some(self.correlator.subscribe())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    async fn start_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    #[tokio::test]
    async fn test_json_reply() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let parsed: Value = serde_json::from_slice(&bytes).unwrap();
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": parsed["id"],
                    "result": {"echo": parsed["method"]}
                });
                Response::builder()
                    .status(200)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap()
            }),
        );

        let url = start_server(app).await;
        let client = HttpClient::new(&url, &BTreeMap::new()).unwrap();
        let result = client.call("tools/list", None).await.unwrap();
        assert_eq!(result, json!({"echo": "tools/list"}));
    }

    #[tokio::test]
    async fn test_sse_framed_reply() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let parsed: Value = serde_json::from_slice(&bytes).unwrap();
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progress": 1}
                });
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": parsed["id"],
                    "result": {"done": true}
                });
                let body = format!("data: {notification}\n\ndata: {reply}\n\n");
                Response::builder()
                    .status(200)
                    .header("content-type", "text/event-stream")
                    .body(Body::from(body))
                    .unwrap()
            }),
        );

        let url = start_server(app).await;
        let client = HttpClient::new(&url, &BTreeMap::new()).unwrap();
        let mut inbound = client.subscribe().unwrap();

        let result = client.call("tools/call", Some(json!({"name": "slow"}))).await.unwrap();
        assert_eq!(result, json!({"done": true}));

        let extra = inbound.recv().await.unwrap();
        assert_eq!(extra.method.as_deref(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_peer_error_envelope() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let parsed: Value = serde_json::from_slice(&bytes).unwrap();
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": parsed["id"],
                    "error": {"code": -32602, "message": "bad params"}
                });
                Response::builder()
                    .status(200)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap()
            }),
        );

        let url = start_server(app).await;
        let client = HttpClient::new(&url, &BTreeMap::new()).unwrap();
        let err = client.call("tools/call", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Peer { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_http_error_maps_into_server_range() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::from("down"))
                    .unwrap()
            }),
        );

        let url = start_server(app).await;
        let client = HttpClient::new(&url, &BTreeMap::new()).unwrap();
        let err = client.call("ping", None).await.unwrap_err();
        match err {
            GatewayError::Peer { code, .. } => {
                assert!((-32099..=-32000).contains(&code));
            }
            other => panic!("expected peer error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_auth_headers_and_session_id() {
        let app = Router::new().route(
            "/mcp",
            post(|req: Request| async move {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                let session = req
                    .headers()
                    .get("mcp-session-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();
                let parsed: Value = serde_json::from_slice(&bytes).unwrap();
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": parsed["id"],
                    "result": {"auth": auth, "session": session}
                });
                Response::builder()
                    .status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "sess-42")
                    .body(Body::from(body.to_string()))
                    .unwrap()
            }),
        );

        let url = start_server(app).await;
        let headers = BTreeMap::from([(
            "Authorization".to_string(),
            "Bearer token-xyz".to_string(),
        )]);
        let client = HttpClient::new(&url, &headers).unwrap();

        let first = client.call("a", None).await.unwrap();
        assert_eq!(first["auth"], "Bearer token-xyz");
        assert_eq!(first["session"], "none");

        let second = client.call("b", None).await.unwrap();
        assert_eq!(second["session"], "sess-42");
    }

    #[tokio::test]
    async fn test_call_after_close_fails() {
        let client = HttpClient::new("http://127.0.0.1:1/mcp", &BTreeMap::new()).unwrap();
        client.close().await.unwrap();
        assert!(matches!(
            client.call("x", None).await.unwrap_err(),
            GatewayError::PeerClosed(_)
        ));
    }
}
