//! LOCAL transport: MCP over a child process.
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC on
//! its stdin/stdout:
//! - one JSON object per line, both directions
//! - responses correlated by id; server-originated messages broadcast
//! - stderr inherited so backend diagnostics reach the gateway's logs
//! - close drops stdin (graceful EOF), then kills the process tree after a
//!   bounded wait

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_types::{BackendConfig, GatewayError, JsonRpcMessage, TransportClient};

use crate::correlate::{await_reply, Correlator};

/// How long a child gets to exit after stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct StdioClient {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl StdioClient {
    /// Spawn the backend's command and wire up the reader task.
    pub async fn spawn(
        config: &BackendConfig,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::ConnectFailed(format!(
                "spawn backend '{}' ({}): {e}",
                config.name, config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("child stdout not piped".to_string()))?;

        info!(backend = %config.name, pid = ?child.id(), "spawned local backend");

        let correlator = Arc::new(Correlator::new());
        let alive = Arc::new(AtomicBool::new(true));

        let reader_correlator = correlator.clone();
        let reader_alive = alive.clone();
        let reader_cancel = cancel.clone();
        let backend_name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<JsonRpcMessage>(line) {
                                Ok(msg) => reader_correlator.route(msg),
                                Err(e) => {
                                    warn!(backend = %backend_name, error = %e, "unparseable line from backend stdout");
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(backend = %backend_name, "backend stdout closed");
                            break;
                        }
                        Err(e) => {
                            warn!(backend = %backend_name, error = %e, "error reading backend stdout");
                            break;
                        }
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            reader_correlator.fail_all();
        });

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            correlator,
            cancel,
            alive,
        })
    }

    async fn send_line(&self, msg: &JsonRpcMessage) -> Result<(), GatewayError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| GatewayError::PeerClosed("child stdin already closed".to_string()))?;
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::PeerClosed(format!("write to child: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| GatewayError::PeerClosed(format!("flush to child: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl TransportClient for StdioClient {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::PeerClosed("child process exited".to_string()));
        }
        let id = self.correlator.next_id();
        let rx = self.correlator.register(id);
        let request = JsonRpcMessage::request(Value::from(id), method, params);
        if let Err(e) = self.send_line(&request).await {
            self.correlator.unregister(id);
            return Err(e);
        }
        await_reply(rx).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        self.send_line(&JsonRpcMessage::notification(method, params)).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<JsonRpcMessage>> {
        Some(self.correlator.subscribe())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.cancel.cancel();
        self.alive.store(false, Ordering::SeqCst);

        // EOF on stdin is the stdio-transport shutdown signal.
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    debug!(status = ?status.ok(), "local backend exited");
                }
                Err(_) => {
                    warn!("local backend ignored shutdown, killing process tree");
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
                }
            }
        }
        self.correlator.fail_all();
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
    use serde_json::json;
    use std::collections::BTreeMap;

    /// A backend that answers every request with `{"echo": <method>}`,
    /// written as a small shell loop so the tests need no fixture binary.
    fn echo_backend() -> BackendConfig {
        BackendConfig {
            name: "echo".to_string(),
            transport: berth_types::TransportKind::Local,
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"while IFS= read -r line; do
                       id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                       method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
                       if [ -n "$id" ]; then
                           printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":"%s"}}\n' "$id" "$method"
                       fi
                   done"#
                    .to_string(),
            ],
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            auto_start: false,
            instructions: None,
            depends_on: Default::default(),
            legacy_sse_probe: true,
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let client = StdioClient::spawn(&echo_backend(), CancellationToken::new())
            .await
            .unwrap();
        let result = client.call("tools/list", None).await.unwrap();
        assert_eq!(result, json!({"echo": "tools/list"}));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate() {
        let client = Arc::new(
            StdioClient::spawn(&echo_backend(), CancellationToken::new())
                .await
                .unwrap(),
        );
        let a = {
            let c = client.clone();
            tokio::spawn(async move { c.call("alpha", None).await })
        };
        let b = {
            let c = client.clone();
            tokio::spawn(async move { c.call("beta", None).await })
        };
        assert_eq!(a.await.unwrap().unwrap(), json!({"echo": "alpha"}));
        assert_eq!(b.await.unwrap().unwrap(), json!({"echo": "beta"}));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connect_failed() {
        let mut config = echo_backend();
        config.command = "definitely-not-a-real-binary".to_string();
        config.args.clear();
        let err = StdioClient::spawn(&config, CancellationToken::new())
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, GatewayError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_call_fails_after() {
        let client = StdioClient::spawn(&echo_backend(), CancellationToken::new())
            .await
            .unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_alive());
        assert!(matches!(
            client.call("ping", None).await.unwrap_err(),
            GatewayError::PeerClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_child_exit_fails_pending_calls() {
        let mut config = echo_backend();
        config.args = vec!["-c".to_string(), "read _line; exit 0".to_string()];
        let client = StdioClient::spawn(&config, CancellationToken::new())
            .await
            .unwrap();
        // The child reads one line and exits without answering.
        let err = client.call("never/answered", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::PeerClosed(_)));
    }
}
