//! Dynamic proxy routes.
//!
//! Status mapping: 200 success, 202 acknowledged (async dispatch into a
//! session), 400 malformed envelope, 404 unknown session/proxy, 429
//! admission rejected, 500 internal, 503 backend not Verified.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use berth_types::{GatewayError, JsonRpcMessage, ProxyTransport};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages", post(global_message))
        .route("/*path", get(proxy_get).post(proxy_post))
        .with_state(state)
}

fn http_status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::UnknownProxy(_) | GatewayError::UnknownSession(_) => StatusCode::NOT_FOUND,
        GatewayError::AdmissionRejected(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Proxy(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Protocol(_) | GatewayError::Serialization(_) | GatewayError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(id: Option<serde_json::Value>, err: &GatewayError) -> Response {
    let envelope = JsonRpcMessage::from_gateway_error(id, err);
    (http_status_for(err), Json(envelope)).into_response()
}

fn client_addr(headers: &HeaderMap, socket: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| socket.ip().to_string())
}

// ============================================================
// GET: event stream or warmup
// ============================================================

async fn proxy_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    ConnectInfo(socket): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(proxy_name) = state.engine.resolve(&path).await else {
        return error_response(None, &GatewayError::UnknownProxy(path));
    };

    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    if !wants_stream {
        // Warmup probe.
        return Json(json!({"status": "ok", "proxy": proxy_name})).into_response();
    }

    if state.engine.transport_of(&proxy_name).await != Some(ProxyTransport::Event) {
        return error_response(
            None,
            &GatewayError::Protocol(format!("proxy '{proxy_name}' does not serve event streams")),
        );
    }
    match state.engine.snapshot(&proxy_name).await.map(|s| s.state) {
        Some(berth_proxy::ProxyState::Running) => {}
        _ => {
            return error_response(
                None,
                &GatewayError::Proxy(format!("proxy '{proxy_name}' is not running")),
            );
        }
    }

    let client = client_addr(&headers, socket);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let ticket = match state.sessions.open(&proxy_name, &client, &user_agent) {
        Ok(ticket) => ticket,
        Err(e) => return error_response(None, &e),
    };
    info!(
        session = %ticket.session_id,
        proxy = %proxy_name,
        client = %client,
        "event stream opened"
    );

    spawn_backend_forwarder(&state, &proxy_name, &ticket.session_id, ticket.cancel.clone());

    let stream = SessionStream {
        rx: ticket.rx,
        sessions: state.sessions.clone(),
        session_id: ticket.session_id,
    };
    Sse::new(stream).into_response()
}

/// Splice server-originated backend messages into this session's queue.
fn spawn_backend_forwarder(
    state: &AppState,
    proxy_name: &str,
    session_id: &str,
    cancel: tokio_util::sync::CancellationToken,
) {
    let state = state.clone();
    let proxy_name = proxy_name.to_string();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let Some(backend) = state.engine.backend_of(&proxy_name).await else {
            return;
        };
        let subscription = match state.registry().subscribe(&backend).await {
            Ok(Some(rx)) => rx,
            _ => return,
        };
        let mut rx = subscription;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(msg) => {
                        if state.sessions.enqueue(&session_id, msg).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %session_id, skipped, "forwarder lagged behind backend stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });
}

/// The session's single writer: drains the pending queue to the socket in
/// FIFO order and closes the session when the client goes away.
struct SessionStream {
    rx: mpsc::Receiver<berth_session::OutboundEvent>,
    sessions: berth_session::SessionManager,
    session_id: String,
}

impl tokio_stream::Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let rendered = match event {
                    berth_session::OutboundEvent::Endpoint(url) => {
                        Event::default().event("endpoint").data(url)
                    }
                    berth_session::OutboundEvent::Message(msg) => Event::default()
                        .event("message")
                        .data(serde_json::to_string(&msg).unwrap_or_default()),
                    berth_session::OutboundEvent::Ping { payload, sent_at } => {
                        this.sessions
                            .ping_delivered(&this.session_id, sent_at.elapsed());
                        Event::default().event("ping").data(payload.to_string())
                    }
                };
                Poll::Ready(Some(Ok(rendered)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.sessions
            .close_detached(&self.session_id, "client disconnected");
    }
}

// ============================================================
// POST: inline calls and session messages
// ============================================================

async fn proxy_post(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let trimmed = path.trim_matches('/');

    // `/{proxy}/messages?sessionId=X` posts into an existing session.
    if let Some(prefix) = trimmed.strip_suffix("/messages") {
        let expected_proxy = state.engine.resolve(prefix).await;
        return session_message(&state, query.get("sessionId"), expected_proxy, &body).await;
    }

    let Some(proxy_name) = state.engine.resolve(trimmed).await else {
        return error_response(None, &GatewayError::UnknownProxy(trimmed.to_string()));
    };

    let msg: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(e) => {
            return error_response(
                None,
                &GatewayError::Protocol(format!("malformed JSON-RPC envelope: {e}")),
            );
        }
    };

    debug!(proxy = %proxy_name, method = ?msg.method, id = ?msg.id, "inline call");
    match state.engine.handle(&proxy_name, &msg).await {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted"})),
        )
            .into_response(),
        Err(e) => error_response(msg.id, &e),
    }
}

async fn global_message(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    session_message(&state, query.get("sessionId"), None, &body).await
}

async fn session_message(
    state: &AppState,
    session_id: Option<&String>,
    expected_proxy: Option<String>,
    body: &Bytes,
) -> Response {
    let Some(session_id) = session_id else {
        return error_response(
            None,
            &GatewayError::Protocol("sessionId query parameter is required".to_string()),
        );
    };

    let msg: JsonRpcMessage = match serde_json::from_slice(body) {
        Ok(msg) => msg,
        Err(e) => {
            return error_response(
                None,
                &GatewayError::Protocol(format!("malformed JSON-RPC envelope: {e}")),
            );
        }
    };

    let Some(proxy_name) = state.sessions.proxy_of(session_id) else {
        return error_response(
            msg.id,
            &GatewayError::UnknownSession(session_id.to_string()),
        );
    };
    if let Some(expected) = expected_proxy {
        if expected != proxy_name {
            return error_response(
                msg.id,
                &GatewayError::Protocol(format!(
                    "session belongs to proxy '{proxy_name}', not '{expected}'"
                )),
            );
        }
    }

    state.sessions.touch(session_id);
    let is_initialize = msg.method.as_deref() == Some("initialize");
    debug!(session = %session_id, proxy = %proxy_name, method = ?msg.method, "session message");

    let accepted = json!({"status": "accepted", "sessionId": session_id});
    match state.engine.handle(&proxy_name, &msg).await {
        Ok(Some(response)) => {
            if is_initialize && response.error.is_none() {
                state.sessions.mark_initialized(session_id);
            }
            match state.sessions.enqueue(session_id, response) {
                Ok(()) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
                Err(e) => error_response(msg.id, &e),
            }
        }
        Ok(None) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => {
            // The client watches the stream; deliver the failure there and
            // still acknowledge the POST.
            let envelope = JsonRpcMessage::from_gateway_error(msg.id, &e);
            match state.sessions.enqueue(session_id, envelope) {
                Ok(()) => (
                    StatusCode::ACCEPTED,
                    Json(json!({"status": "error", "sessionId": session_id})),
                )
                    .into_response(),
                Err(enqueue_err) => error_response(None, &enqueue_err),
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================
