//! EVENT session lifecycle.
//!
//! Each session owns a bounded pending queue (a `mpsc` channel of capacity
//! `max_queue`) whose receiver is drained by the single writer, the SSE
//! response stream. FIFO delivery is the channel's order. Overflowing the
//! queue force-closes the session; a slow reader never grows memory.
//!
//! A background reaper closes sessions that go idle, never initialize, or
//! whose backend stays out of Verified beyond the grace period. Close is
//! idempotent and cancels the session's token; the writer, heartbeat, and
//! any forwarder tasks all observe it before the record is considered
//! settled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_types::{GatewayError, HeartbeatConfig, JsonRpcMessage, RateLimitConfig, SessionConfig};

use crate::admission::AdmissionControl;
use crate::heartbeat::HeartbeatController;

/// Bound on how long a heartbeat may wait for queue space.
const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// An event queued for delivery on a session's outbound stream.
#[derive(Debug)]
pub enum OutboundEvent {
    /// Discovery event telling the client where to POST follow-ups.
    Endpoint(String),
    /// A JSON-RPC message (response or server-originated).
    Message(JsonRpcMessage),
    /// Liveness ping; `sent_at` lets the writer report delivery time.
    Ping { payload: Value, sent_at: Instant },
}

/// Everything the ingress layer needs to run a session's writer.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: String,
    pub rx: mpsc::Receiver<OutboundEvent>,
    pub cancel: CancellationToken,
}

struct Session {
    proxy_name: String,
    client_addr: String,
    user_agent: String,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    last_activity: Instant,
    initialized: bool,
    tx: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
    heartbeat_task: Option<JoinHandle<()>>,
}

/// Serializable per-session view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub proxy_name: String,
    pub client_addr: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub initialized: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub initialized: usize,
    pub by_proxy: HashMap<String, usize>,
    pub sessions: Vec<SessionSnapshot>,
}

/// Lets the reaper ask how long a proxy's backend has been unavailable
/// without depending on the proxy engine crate.
#[async_trait]
pub trait BackendHealth: Send + Sync {
    async fn not_verified_for(&self, proxy_name: &str) -> Option<Duration>;
}

struct ManagerInner {
    sessions: Mutex<HashMap<String, Session>>,
    admission: AdmissionControl,
    heartbeat: HeartbeatController,
    config: SessionConfig,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        rate_limit: RateLimitConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: Mutex::new(HashMap::new()),
                admission: AdmissionControl::new(rate_limit),
                heartbeat: HeartbeatController::new(heartbeat),
                config,
            }),
        }
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.inner.admission
    }

    pub fn heartbeat(&self) -> &HeartbeatController {
        &self.inner.heartbeat
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Open a new session on a proxy: admission check, fresh id, queue
    /// seeded with the endpoint discovery event, heartbeat ticker spawned.
    pub fn open(
        &self,
        proxy_name: &str,
        client_addr: &str,
        user_agent: &str,
    ) -> Result<SessionTicket, GatewayError> {
        self.inner.admission.admit(proxy_name, client_addr)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.inner.config.max_queue);
        let cancel = CancellationToken::new();

        // The queue is empty here; seeding the discovery event cannot fail.
        let endpoint = format!("/messages?sessionId={session_id}");
        tx.try_send(OutboundEvent::Endpoint(endpoint))
            .map_err(|_| GatewayError::Internal("fresh session queue full".to_string()))?;

        self.inner.heartbeat.register(&session_id);
        let heartbeat_task = self.spawn_heartbeat(&session_id, tx.clone(), cancel.clone());

        let session = Session {
            proxy_name: proxy_name.to_string(),
            client_addr: client_addr.to_string(),
            user_agent: user_agent.to_string(),
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            last_activity: Instant::now(),
            initialized: false,
            tx,
            cancel: cancel.clone(),
            heartbeat_task: Some(heartbeat_task),
        };
        self.lock().insert(session_id.clone(), session);
        info!(
            session = %session_id,
            proxy = %proxy_name,
            client = %client_addr,
            total = self.session_count(),
            "session opened"
        );

        Ok(SessionTicket {
            session_id,
            rx,
            cancel,
        })
    }

    /// Queue an outbound message for a session, preserving FIFO order.
    /// A full queue force-closes the session.
    pub fn enqueue(&self, session_id: &str, msg: JsonRpcMessage) -> Result<(), GatewayError> {
        let tx = {
            let sessions = self.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| GatewayError::UnknownSession(session_id.to_string()))?;
            session.tx.clone()
        };
        match tx.try_send(OutboundEvent::Message(msg)) {
            Ok(()) => {
                self.touch(session_id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %session_id, "pending queue overflow, closing session");
                self.close_detached(session_id, "pending queue overflow");
                Err(GatewayError::QueueOverflow(format!(
                    "session {session_id} exceeded its pending queue bound"
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close_detached(session_id, "writer gone");
                Err(GatewayError::Session(format!(
                    "session {session_id} writer is gone"
                )))
            }
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.lock().get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn mark_initialized(&self, session_id: &str) {
        if let Some(session) = self.lock().get_mut(session_id) {
            session.initialized = true;
        }
    }

    /// The proxy a session belongs to; `None` for unknown sessions.
    pub fn proxy_of(&self, session_id: &str) -> Option<String> {
        self.lock().get(session_id).map(|s| s.proxy_name.clone())
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Report a delivered ping back to the heartbeat metrics.
    pub fn ping_delivered(&self, session_id: &str, elapsed: Duration) {
        self.inner.heartbeat.record_delivery(session_id, elapsed);
    }

    /// Close a session: idempotent; cancels the token, releases the
    /// admission slot, and waits (bounded) for the heartbeat task to exit.
    pub async fn close(&self, session_id: &str, reason: &str) -> bool {
        let session = self.lock().remove(session_id);
        let Some(mut session) = session else {
            return false;
        };
        session.cancel.cancel();
        self.inner
            .admission
            .release(&session.proxy_name, &session.client_addr);
        if let Some(task) = session.heartbeat_task.take() {
            let deadline = Duration::from_secs(self.inner.config.cancel_deadline_secs);
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!(session = %session_id, "heartbeat task missed the cancel deadline");
            }
        }
        self.inner.heartbeat.remove(session_id);
        info!(
            session = %session_id,
            proxy = %session.proxy_name,
            reason,
            age_secs = session.created_at.elapsed().as_secs(),
            "session closed"
        );
        true
    }

    /// Fire-and-forget close for non-async contexts (stream drop, ticker).
    pub fn close_detached(&self, session_id: &str, reason: &str) {
        let manager = self.clone();
        let session_id = session_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            manager.close(&session_id, &reason).await;
        });
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.lock();
        let mut by_proxy: HashMap<String, usize> = HashMap::new();
        let mut snapshots = Vec::with_capacity(sessions.len());
        let mut initialized = 0;
        for (id, session) in sessions.iter() {
            *by_proxy.entry(session.proxy_name.clone()).or_insert(0) += 1;
            if session.initialized {
                initialized += 1;
            }
            snapshots.push(SessionSnapshot {
                session_id: id.clone(),
                proxy_name: session.proxy_name.clone(),
                client_addr: session.client_addr.clone(),
                user_agent: session.user_agent.clone(),
                created_at: session.created_at_utc,
                age_secs: session.created_at.elapsed().as_secs(),
                idle_secs: session.last_activity.elapsed().as_secs(),
                initialized: session.initialized,
            });
        }
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        SessionStats {
            total: sessions.len(),
            initialized,
            by_proxy,
            sessions: snapshots,
        }
    }

    /// Run the idle reaper until the gateway shuts down.
    pub fn spawn_reaper(&self, health: Arc<dyn BackendHealth>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(manager.inner.config.reap_interval_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_once(health.as_ref()).await;
            }
        })
    }

    /// One reaper sweep; exposed for tests.
    pub async fn reap_once(&self, health: &dyn BackendHealth) -> usize {
        let idle_ttl = Duration::from_secs(self.inner.config.idle_ttl_secs);
        let init_deadline = Duration::from_secs(self.inner.config.init_deadline_secs);
        let backend_grace = Duration::from_secs(self.inner.config.backend_grace_secs);

        let mut expired: Vec<(String, String)> = Vec::new();
        let proxies: Vec<(String, String)> = {
            let sessions = self.lock();
            for (id, session) in sessions.iter() {
                if session.last_activity.elapsed() > idle_ttl {
                    expired.push((id.clone(), "idle".to_string()));
                } else if !session.initialized && session.created_at.elapsed() > init_deadline {
                    // Never-initialized sessions are reaped as critical.
                    expired.push((id.clone(), "initialization deadline".to_string()));
                }
            }
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.proxy_name.clone()))
                .collect()
        };

        for (id, proxy) in proxies {
            if expired.iter().any(|(e, _)| e == &id) {
                continue;
            }
            if let Some(down_for) = health.not_verified_for(&proxy).await {
                if down_for > backend_grace {
                    expired.push((id, format!("backend unavailable for {}s", down_for.as_secs())));
                }
            }
        }

        let count = expired.len();
        for (id, reason) in expired {
            debug!(session = %id, reason = %reason, "reaping session");
            self.close(&id, &reason).await;
        }
        if count > 0 {
            info!(reaped = count, remaining = self.session_count(), "reaper sweep complete");
        }
        count
    }

    // --------------------------------------------------------
    // Internals
    // --------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One ticker per session pushes `notifications/ping` onto the queue
    /// at the adaptive interval. Three consecutive queue failures mark the
    /// session unhealthy and close it.
    fn spawn_heartbeat(
        &self,
        session_id: &str,
        tx: mpsc::Sender<OutboundEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let interval = manager.inner.heartbeat.interval(&session_id);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let payload = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/ping",
                    "params": {
                        "timestamp": Utc::now().timestamp_millis(),
                        "sessionId": session_id,
                    },
                });
                let event = OutboundEvent::Ping {
                    payload,
                    sent_at: Instant::now(),
                };
                // A full queue gets a bounded wait before counting as a
                // failed heartbeat.
                match tokio::time::timeout(HEARTBEAT_SEND_TIMEOUT, tx.send(event)).await {
                    Ok(Ok(())) => {
                        manager.inner.heartbeat.note_sent(&session_id);
                    }
                    Ok(Err(_closed)) => break,
                    Err(_elapsed) => {
                        if manager.inner.heartbeat.note_failure(&session_id) {
                            warn!(session = %session_id, "heartbeat unhealthy, closing session");
                            manager.close_detached(&session_id, "heartbeat failures");
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct HealthyBackends;

    #[async_trait]
    impl BackendHealth for HealthyBackends {
        async fn not_verified_for(&self, _proxy: &str) -> Option<Duration> {
            None
        }
    }

    struct DownBackends(Duration);

    #[async_trait]
    impl BackendHealth for DownBackends {
        async fn not_verified_for(&self, _proxy: &str) -> Option<Duration> {
            Some(self.0)
        }
    }

    fn manager_with(config: SessionConfig) -> SessionManager {
        SessionManager::new(
            config,
            RateLimitConfig::default(),
            HeartbeatConfig::default(),
        )
    }

    fn manager() -> SessionManager {
        manager_with(SessionConfig::default())
    }

    fn message(n: i64) -> JsonRpcMessage {
        JsonRpcMessage::response(Some(serde_json::json!(n)), serde_json::json!({"n": n}))
    }

    #[tokio::test]
    async fn test_open_seeds_endpoint_event() {
        let manager = manager();
        let mut ticket = manager.open("p", "10.0.0.1", "test-agent").unwrap();
        match ticket.rx.recv().await.unwrap() {
            OutboundEvent::Endpoint(url) => {
                assert!(url.starts_with("/messages?sessionId="));
                assert!(url.contains(&ticket.session_id));
            }
            other => panic!("expected endpoint event, got {other:?}"),
        }
        manager.close(&ticket.session_id, "test done").await;
    }

    #[tokio::test]
    async fn test_enqueue_preserves_fifo_order() {
        let manager = manager();
        let mut ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        // Drain the discovery event first.
        let _ = ticket.rx.recv().await.unwrap();

        for n in 0..5 {
            manager.enqueue(&ticket.session_id, message(n)).unwrap();
        }
        for n in 0..5 {
            match ticket.rx.recv().await.unwrap() {
                OutboundEvent::Message(msg) => {
                    assert_eq!(msg.id, Some(serde_json::json!(n)));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        manager.close(&ticket.session_id, "test done").await;
    }

    #[tokio::test]
    async fn test_queue_overflow_closes_session() {
        let config = SessionConfig {
            max_queue: 4,
            ..SessionConfig::default()
        };
        let manager = manager_with(config);
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();

        // The discovery event occupies one slot; the client reads nothing.
        let mut overflowed = false;
        for n in 0..10 {
            match manager.enqueue(&ticket.session_id, message(n)) {
                Ok(()) => {}
                Err(GatewayError::QueueOverflow(_)) => {
                    overflowed = true;
                    // Queue bound is 4: discovery + 3 messages fit.
                    assert_eq!(n, 3);
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(overflowed);

        // The close is detached; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(
            manager.enqueue(&ticket.session_id, message(99)).unwrap_err(),
            GatewayError::UnknownSession(_)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels_token() {
        let manager = manager();
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        let cancel = ticket.cancel.clone();

        assert!(manager.close(&ticket.session_id, "first").await);
        assert!(!manager.close(&ticket.session_id, "second").await);
        assert!(cancel.is_cancelled());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_frees_admission_slot() {
        let manager = SessionManager::new(
            SessionConfig::default(),
            RateLimitConfig {
                max_sessions_per_client: 1,
                ..RateLimitConfig::default()
            },
            HeartbeatConfig::default(),
        );
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        assert!(matches!(
            manager.open("p", "10.0.0.1", "t").unwrap_err(),
            GatewayError::AdmissionRejected(_)
        ));
        manager.close(&ticket.session_id, "done").await;
        manager.open("p", "10.0.0.1", "t").unwrap();
    }

    #[tokio::test]
    async fn test_reaper_closes_uninitialized_sessions() {
        let config = SessionConfig {
            init_deadline_secs: 0,
            ..SessionConfig::default()
        };
        let manager = manager_with(config);
        let _ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaped = manager.reap_once(&HealthyBackends).await;
        assert_eq!(reaped, 1);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_reaper_spares_initialized_active_sessions() {
        let config = SessionConfig {
            init_deadline_secs: 0,
            ..SessionConfig::default()
        };
        let manager = manager_with(config);
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        manager.mark_initialized(&ticket.session_id);

        assert_eq!(manager.reap_once(&HealthyBackends).await, 0);
        assert_eq!(manager.session_count(), 1);
        manager.close(&ticket.session_id, "done").await;
    }

    #[tokio::test]
    async fn test_reaper_applies_backend_grace() {
        let manager = manager();
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        manager.mark_initialized(&ticket.session_id);

        // Backend down, but within grace: spared.
        assert_eq!(
            manager.reap_once(&DownBackends(Duration::from_secs(5))).await,
            0
        );
        // Beyond the grace period: reaped.
        assert_eq!(
            manager.reap_once(&DownBackends(Duration::from_secs(60))).await,
            1
        );
    }

    #[tokio::test]
    async fn test_idle_reap() {
        let config = SessionConfig {
            idle_ttl_secs: 0,
            ..SessionConfig::default()
        };
        let manager = manager_with(config);
        let ticket = manager.open("p", "10.0.0.1", "t").unwrap();
        manager.mark_initialized(&ticket.session_id);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.reap_once(&HealthyBackends).await, 1);
    }

    #[tokio::test]
    async fn test_stats_reflect_sessions() {
        let manager = manager();
        let t1 = manager.open("p", "10.0.0.1", "agent-a").unwrap();
        let t2 = manager.open("q", "10.0.0.2", "agent-b").unwrap();
        manager.mark_initialized(&t1.session_id);

        let stats = manager.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.initialized, 1);
        assert_eq!(stats.by_proxy["p"], 1);
        assert_eq!(stats.by_proxy["q"], 1);

        manager.close(&t1.session_id, "done").await;
        manager.close(&t2.session_id, "done").await;
    }

    #[tokio::test]
    async fn test_proxy_of_resolves_binding() {
        let manager = manager();
        let ticket = manager.open("notion", "10.0.0.1", "t").unwrap();
        assert_eq!(manager.proxy_of(&ticket.session_id).as_deref(), Some("notion"));
        assert!(manager.proxy_of("unknown").is_none());
        manager.close(&ticket.session_id, "done").await;
    }
}
