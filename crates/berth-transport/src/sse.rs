//! EVENT transport: MCP over a server-push event stream.
//!
//! A long-lived GET with `Accept: text/event-stream` carries inbound
//! messages; outbound requests go via POST to the message endpoint the
//! server announces in its `endpoint` event. The stream reconnects on
//! transient failure with capped exponential backoff and jitter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_types::compliance::http_status_to_code;
use berth_types::{GatewayError, JsonRpcMessage, TransportClient};

use crate::correlate::{await_reply, Correlator};
use crate::retry::backoff_delay;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

// ============================================================
// SSE decoding
// ============================================================

/// A parsed event from a `text/event-stream` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder: feed it chunks as they arrive, get back the
/// events completed so far. Events are blank-line delimited; multiple
/// `data:` lines accumulate with newlines; comment lines are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = parse_block(block.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = line[pos + 1..].strip_prefix(' ').unwrap_or(&line[pos + 1..]);
                (&line[..pos], value)
            }
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }

    has_data.then_some(event)
}

/// Resolve a message-endpoint reference against the stream URL's origin.
fn resolve_endpoint(stream_url: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let origin_end = stream_url
        .find("://")
        .map(|i| i + 3)
        .and_then(|i| stream_url[i..].find('/').map(|j| i + j))
        .unwrap_or(stream_url.len());
    if target.starts_with('/') {
        format!("{}{}", &stream_url[..origin_end], target)
    } else {
        format!("{}/{}", &stream_url[..origin_end], target)
    }
}

// ============================================================
// SseClient
// ============================================================

#[derive(Debug)]
pub struct SseClient {
    http: reqwest::Client,
    headers: BTreeMap<String, String>,
    post_url: watch::Receiver<Option<String>>,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl SseClient {
    /// Open the event stream. Fails fast when the initial connection is
    /// refused; later stream drops reconnect in the background.
    pub async fn connect(
        url: &str,
        headers: &BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Internal(format!("build http client: {e}")))?;

        let initial = open_stream(&http, url, headers).await?;
        info!(url, "event stream established");

        let correlator = Arc::new(Correlator::new());
        let alive = Arc::new(AtomicBool::new(true));
        let (post_tx, post_rx) = watch::channel(None);

        let task = StreamTask {
            http: http.clone(),
            url: url.to_string(),
            headers: headers.clone(),
            correlator: correlator.clone(),
            post_tx,
            cancel: cancel.clone(),
            alive: alive.clone(),
        };
        tokio::spawn(task.run(initial));

        Ok(Self {
            http,
            headers: headers.clone(),
            post_url: post_rx,
            correlator,
            cancel,
            alive,
        })
    }

    async fn message_endpoint(&self) -> Result<String, GatewayError> {
        let mut rx = self.post_url.clone();
        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| GatewayError::PeerClosed("event stream closed".to_string()))?;
        value
            .clone()
            .ok_or_else(|| GatewayError::Internal("endpoint watch empty".to_string()))
    }

    async fn post_message(&self, msg: &JsonRpcMessage) -> Result<(), GatewayError> {
        let endpoint = self.message_endpoint().await?;
        let mut request = self.http.post(&endpoint).json(msg).timeout(POST_TIMEOUT);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Peer {
                code: http_status_to_code(status.as_u16()),
                message: format!("message endpoint returned HTTP {status}"),
                data: None,
            });
        }
        // Some servers answer the POST body inline instead of (or before)
        // pushing the reply on the stream; route it either way.
        let body = response.text().await.unwrap_or_default();
        if !body.trim().is_empty() {
            if let Ok(reply) = serde_json::from_str::<JsonRpcMessage>(&body) {
                self.correlator.route(reply);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportClient for SseClient {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::PeerClosed("event stream closed".to_string()));
        }
        let id = self.correlator.next_id();
        let rx = self.correlator.register(id);
        let request = JsonRpcMessage::request(Value::from(id), method, params);
        if let Err(e) = self.post_message(&request).await {
            self.correlator.unregister(id);
            return Err(e);
        }
        await_reply(rx).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        self.post_message(&JsonRpcMessage::notification(method, params)).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<JsonRpcMessage>> {
        Some(self.correlator.subscribe())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.cancel.cancel();
        self.alive.store(false, Ordering::SeqCst);
        self.correlator.fail_all();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

async fn open_stream(
    http: &reqwest::Client,
    url: &str,
    headers: &BTreeMap<String, String>,
) -> Result<reqwest::Response, GatewayError> {
    let mut request = http.get(url).header("Accept", "text/event-stream");
    for (key, value) in headers {
        request = request.header(key, value);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::ConnectFailed(format!(
            "event stream endpoint returned HTTP {status}"
        )));
    }
    Ok(response)
}

struct StreamTask {
    http: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    correlator: Arc<Correlator>,
    post_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl StreamTask {
    async fn run(self, initial: reqwest::Response) {
        let mut response = Some(initial);
        let mut attempt: u32 = 0;

        loop {
            let current = match response.take() {
                Some(r) => r,
                None => match open_stream(&self.http, &self.url, &self.headers).await {
                    Ok(r) => {
                        debug!(url = %self.url, "event stream reconnected");
                        attempt = 0;
                        r
                    }
                    Err(e) => {
                        attempt += 1;
                        warn!(url = %self.url, attempt, error = %e, "event stream reconnect failed");
                        let delay = backoff_delay(RECONNECT_BASE, attempt, RECONNECT_CAP);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            self.consume(current).await;
            if self.cancel.is_cancelled() {
                break;
            }
            attempt += 1;
            let delay = backoff_delay(RECONNECT_BASE, attempt, RECONNECT_CAP);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        self.correlator.fail_all();
    }

    /// Drain one stream until it ends or the client is closed.
    async fn consume(&self, response: reqwest::Response) {
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                            self.handle_event(event);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(url = %self.url, error = %e, "event stream read error");
                        return;
                    }
                    None => {
                        debug!(url = %self.url, "event stream ended");
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: SseEvent) {
        match event.event.as_deref() {
            Some("endpoint") => {
                let endpoint = resolve_endpoint(&self.url, event.data.trim());
                debug!(endpoint = %endpoint, "discovered message endpoint");
                self.post_tx.send_replace(Some(endpoint));
            }
            Some("message") | None => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(msg) => self.correlator.route(msg),
                Err(e) => {
                    warn!(error = %e, data = %event.data, "unparseable event payload");
                }
            },
            Some("ping") => {}
            Some(other) => {
                debug!(event = other, "ignoring unknown event type");
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================
