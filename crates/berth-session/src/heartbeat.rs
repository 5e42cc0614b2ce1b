//! Adaptive heartbeat state for EVENT sessions.
//!
//! The session manager runs one ticker task per session; this module owns
//! the per-session metrics and the adaptation rule. Every
//! `evaluation_ticks` ticks:
//! - error rate > `grow_error_rate` ⇒ interval ×1.5, capped
//! - error rate < `shrink_error_rate` and mean delivery time under
//!   `shrink_rtt_ms` ⇒ interval ×0.8, floored
//!
//! Delivery time is measured from enqueue to socket write; the writer
//! reports it back via [`HeartbeatController::record_delivery`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use berth_types::HeartbeatConfig;

const GROW_FACTOR: f64 = 1.5;
const SHRINK_FACTOR: f64 = 0.8;

#[derive(Debug)]
struct SessionHeartbeat {
    sent: u64,
    failed: u64,
    consecutive_failures: u32,
    ticks: u32,
    window_attempts: u32,
    window_failures: u32,
    rtt_samples: VecDeque<f64>,
    last_rtt_ms: Option<f64>,
    interval_secs: f64,
}

impl SessionHeartbeat {
    fn new(config: &HeartbeatConfig) -> Self {
        Self {
            sent: 0,
            failed: 0,
            consecutive_failures: 0,
            ticks: 0,
            window_attempts: 0,
            window_failures: 0,
            rtt_samples: VecDeque::with_capacity(config.rtt_window),
            last_rtt_ms: None,
            interval_secs: config.initial_interval_secs as f64,
        }
    }

    fn mean_rtt_ms(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
    }

    fn evaluate(&mut self, config: &HeartbeatConfig) {
        if self.window_attempts == 0 {
            return;
        }
        let error_rate = f64::from(self.window_failures) / f64::from(self.window_attempts);
        let mean_rtt = self.mean_rtt_ms();

        let previous = self.interval_secs;
        if error_rate > config.grow_error_rate {
            self.interval_secs =
                (self.interval_secs * GROW_FACTOR).min(config.max_interval_secs as f64);
        } else if error_rate < config.shrink_error_rate
            && mean_rtt.is_some_and(|rtt| rtt < config.shrink_rtt_ms)
        {
            self.interval_secs =
                (self.interval_secs * SHRINK_FACTOR).max(config.min_interval_secs as f64);
        }
        if (self.interval_secs - previous).abs() > f64::EPSILON {
            debug!(
                error_rate,
                mean_rtt_ms = mean_rtt,
                from = previous,
                to = self.interval_secs,
                "heartbeat interval adapted"
            );
        }
        self.window_attempts = 0;
        self.window_failures = 0;
    }
}

/// Per-session heartbeat metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatMetrics {
    pub sent: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub last_rtt_ms: Option<f64>,
    pub mean_rtt_ms: Option<f64>,
    pub interval_secs: f64,
}

/// Aggregated metrics across all sessions.
#[derive(Debug, Clone, Serialize)]
pub struct OverallHeartbeatMetrics {
    pub sessions: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub mean_rtt_ms: Option<f64>,
}

pub struct HeartbeatController {
    config: RwLock<HeartbeatConfig>,
    sessions: Mutex<HashMap<String, SessionHeartbeat>>,
}

impl HeartbeatController {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config: RwLock::new(config),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: HeartbeatConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn register(&self, session_id: &str) {
        let config = self.config();
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.to_string(), SessionHeartbeat::new(&config));
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }

    /// Current adaptive interval for a session.
    pub fn interval(&self, session_id: &str) -> Duration {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let secs = sessions
            .get(session_id)
            .map(|s| s.interval_secs)
            .unwrap_or(self.config().initial_interval_secs as f64);
        Duration::from_secs_f64(secs)
    }

    /// Record a ping that made it onto the queue.
    pub fn note_sent(&self, session_id: &str) {
        let config = self.config();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        session.sent += 1;
        session.consecutive_failures = 0;
        session.ticks += 1;
        session.window_attempts += 1;
        if session.ticks % config.evaluation_ticks == 0 {
            session.evaluate(&config);
        }
    }

    /// Record a ping that could not be queued. Returns true when the
    /// session crossed the consecutive-failure threshold and must be
    /// treated as unhealthy.
    pub fn note_failure(&self, session_id: &str) -> bool {
        let config = self.config();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.failed += 1;
        session.consecutive_failures += 1;
        session.ticks += 1;
        session.window_attempts += 1;
        session.window_failures += 1;
        if session.ticks % config.evaluation_ticks == 0 {
            session.evaluate(&config);
        }
        session.consecutive_failures >= config.max_consecutive_failures
    }

    /// Record delivery time for a ping the writer pushed to the socket.
    pub fn record_delivery(&self, session_id: &str, elapsed: Duration) {
        let config = self.config();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        let rtt_ms = elapsed.as_secs_f64() * 1000.0;
        session.last_rtt_ms = Some(rtt_ms);
        if session.rtt_samples.len() >= config.rtt_window {
            session.rtt_samples.pop_front();
        }
        session.rtt_samples.push_back(rtt_ms);
    }

    pub fn metrics(&self, session_id: &str) -> Option<HeartbeatMetrics> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(session_id).map(|s| HeartbeatMetrics {
            sent: s.sent,
            failed: s.failed,
            consecutive_failures: s.consecutive_failures,
            last_rtt_ms: s.last_rtt_ms,
            mean_rtt_ms: s.mean_rtt_ms(),
            interval_secs: s.interval_secs,
        })
    }

    pub fn overall(&self) -> OverallHeartbeatMetrics {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total_sent: u64 = sessions.values().map(|s| s.sent).sum();
        let total_failed: u64 = sessions.values().map(|s| s.failed).sum();
        let attempts = total_sent + total_failed;
        let mut samples = 0usize;
        let mut sum = 0.0f64;
        for session in sessions.values() {
            samples += session.rtt_samples.len();
            sum += session.rtt_samples.iter().sum::<f64>();
        }
        OverallHeartbeatMetrics {
            sessions: sessions.len(),
            total_sent,
            total_failed,
            success_rate: if attempts == 0 {
                100.0
            } else {
                total_sent as f64 / attempts as f64 * 100.0
            },
            mean_rtt_ms: (samples > 0).then(|| sum / samples as f64),
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> HeartbeatController {
        HeartbeatController::new(HeartbeatConfig::default())
    }

    #[test]
    fn test_interval_grows_under_failures() {
        let hb = controller();
        hb.register("s");
        assert_eq!(hb.interval("s"), Duration::from_secs(10));

        // 50% failure over one evaluation window.
        for i in 0..6 {
            if i % 2 == 0 {
                hb.note_failure("s");
            } else {
                hb.note_sent("s");
            }
        }
        assert_eq!(hb.interval("s"), Duration::from_secs_f64(15.0));
    }

    #[test]
    fn test_interval_never_escapes_bounds() {
        let hb = controller();
        hb.register("s");
        // Many windows of pure failure: capped at 30 s.
        for _ in 0..60 {
            hb.note_failure("s");
        }
        assert_eq!(hb.interval("s"), Duration::from_secs(30));

        // Many healthy windows with fast deliveries: floored at 5 s.
        for _ in 0..120 {
            hb.record_delivery("s", Duration::from_millis(50));
            hb.note_sent("s");
        }
        assert_eq!(hb.interval("s"), Duration::from_secs(5));
    }

    #[test]
    fn test_interval_shrinks_only_when_fast_and_clean() {
        let hb = controller();
        hb.register("s");
        // Healthy but slow: mean RTT over the threshold, no shrink.
        for _ in 0..6 {
            hb.record_delivery("s", Duration::from_millis(1000));
            hb.note_sent("s");
        }
        assert_eq!(hb.interval("s"), Duration::from_secs(10));
    }

    #[test]
    fn test_no_shrink_without_delivery_samples() {
        let hb = controller();
        hb.register("s");
        for _ in 0..6 {
            hb.note_sent("s");
        }
        assert_eq!(hb.interval("s"), Duration::from_secs(10));
    }

    #[test]
    fn test_consecutive_failures_mark_unhealthy() {
        let hb = controller();
        hb.register("s");
        assert!(!hb.note_failure("s"));
        assert!(!hb.note_failure("s"));
        assert!(hb.note_failure("s"), "third consecutive failure is unhealthy");

        // A success resets the streak.
        hb.register("t");
        hb.note_failure("t");
        hb.note_failure("t");
        hb.note_sent("t");
        assert!(!hb.note_failure("t"));
    }

    #[test]
    fn test_rtt_window_is_bounded() {
        let hb = controller();
        hb.register("s");
        for i in 0..100 {
            hb.record_delivery("s", Duration::from_millis(i));
        }
        let metrics = hb.metrics("s").unwrap();
        assert_eq!(metrics.last_rtt_ms, Some(99.0));
        // Window keeps the newest 64 samples: 36..=99.
        assert_eq!(metrics.mean_rtt_ms, Some((36..=99).sum::<u64>() as f64 / 64.0));
    }

    #[test]
    fn test_overall_metrics() {
        let hb = controller();
        hb.register("a");
        hb.register("b");
        hb.note_sent("a");
        hb.note_sent("b");
        hb.note_failure("b");

        let overall = hb.overall();
        assert_eq!(overall.sessions, 2);
        assert_eq!(overall.total_sent, 2);
        assert_eq!(overall.total_failed, 1);
        assert!((overall.success_rate - 66.666).abs() < 0.1);
    }
}
