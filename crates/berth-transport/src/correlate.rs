//! Request/response correlation shared by the stream-oriented transports.
//!
//! Each outbound request gets a fresh numeric id; the reader task routes
//! inbound messages either to the waiting caller (responses) or onto the
//! broadcast stream (server-originated requests and notifications).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use berth_types::{GatewayError, JsonRpcMessage};

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) struct Correlator {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<JsonRpcMessage>>>,
    inbound: broadcast::Sender<JsonRpcMessage>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound,
        }
    }

    pub(crate) fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: i64) -> oneshot::Receiver<JsonRpcMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);
        rx
    }

    pub(crate) fn unregister(&self, id: i64) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    /// Route an inbound message: responses complete their waiting caller,
    /// everything else goes to subscribers.
    pub(crate) fn route(&self, msg: JsonRpcMessage) {
        if msg.is_response() {
            if let Some(id) = msg.id.as_ref().and_then(Value::as_i64) {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                    return;
                }
            }
            debug!(id = ?msg.id, "dropping response with no waiting caller");
            return;
        }
        // No subscribers is fine; the message is simply dropped.
        let _ = self.inbound.send(msg);
    }

    /// Drop all waiting callers; their receivers resolve to `PeerClosed`.
    pub(crate) fn fail_all(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JsonRpcMessage> {
        self.inbound.subscribe()
    }
}

/// Await a correlated reply and unwrap it into the JSON-RPC result.
pub(crate) async fn await_reply(
    rx: oneshot::Receiver<JsonRpcMessage>,
) -> Result<Value, GatewayError> {
    let msg = rx
        .await
        .map_err(|_| GatewayError::PeerClosed("connection closed before reply".to_string()))?;
    unwrap_reply(msg)
}

/// Turn a reply envelope into `Ok(result)` or the peer's error.
pub(crate) fn unwrap_reply(msg: JsonRpcMessage) -> Result<Value, GatewayError> {
    if let Some(err) = msg.error {
        return Err(GatewayError::Peer {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(msg.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_response_completes_waiter() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let rx = correlator.register(id);

        correlator.route(JsonRpcMessage::response(Some(json!(id)), json!({"ok": true})));
        let result = await_reply(rx).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn test_peer_error_surfaces() {
        let correlator = Correlator::new();
        let id = correlator.next_id();
        let rx = correlator.register(id);

        correlator.route(JsonRpcMessage::error_response(Some(json!(id)), -32601, "nope"));
        let err = await_reply(rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Peer { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_notification_goes_to_subscribers() {
        let correlator = Correlator::new();
        let mut sub = correlator.subscribe();
        correlator.route(JsonRpcMessage::notification("notifications/progress", None));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.method.as_deref(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_to_peer_closed() {
        let correlator = Correlator::new();
        let rx = correlator.register(correlator.next_id());
        correlator.fail_all();
        assert!(matches!(
            await_reply(rx).await.unwrap_err(),
            GatewayError::PeerClosed(_)
        ));
    }
}
