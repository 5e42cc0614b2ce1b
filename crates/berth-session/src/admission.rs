//! Rate limit and admission control for EVENT sessions.
//!
//! Three checks gate every session creation:
//! - live sessions for the client IP vs `max_sessions_per_client`
//! - live sessions on the proxy vs `max_sessions_per_proxy`
//! - creations by the client inside the rolling window vs cap + burst
//!
//! Every rejection is recorded as a violation with a severity scaled by
//! how far over the threshold the client is; the violation log is
//! append-only, bounded, and pruned to a one-hour window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use berth_types::{GatewayError, RateLimitConfig};

/// Retention window for recorded violations.
const VIOLATION_WINDOW: Duration = Duration::from_secs(3600);
/// Hard bound on the violation ring.
const VIOLATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ClientLimit,
    ProxyLimit,
    CreationRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One recorded admission rejection.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub at: DateTime<Utc>,
    pub client_addr: String,
    pub proxy_name: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub reason: String,
    #[serde(skip)]
    recorded: Instant,
}

#[derive(Default)]
struct AdmissionState {
    /// Session-creation timestamps per client, pruned to the window.
    creation_history: HashMap<String, VecDeque<Instant>>,
    /// Live session counts.
    client_sessions: HashMap<String, usize>,
    proxy_sessions: HashMap<String, usize>,
    violations: VecDeque<Violation>,
}

/// Serializable admission status for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatus {
    pub config: RateLimitConfig,
    pub total_sessions: usize,
    pub sessions_by_proxy: HashMap<String, usize>,
    pub sessions_by_client: HashMap<String, usize>,
    pub violations_last_hour: usize,
    pub violations_by_severity: HashMap<Severity, usize>,
}

pub struct AdmissionControl {
    config: RwLock<RateLimitConfig>,
    state: Mutex<AdmissionState>,
}

impl AdmissionControl {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in new limits at runtime.
    pub fn set_config(&self, config: RateLimitConfig) {
        info!(
            max_sessions_per_client = config.max_sessions_per_client,
            max_sessions_per_proxy = config.max_sessions_per_proxy,
            "admission limits updated"
        );
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    /// Decide whether a new session may be created, reserving the slot on
    /// success. Call [`AdmissionControl::release`] when the session closes.
    pub fn admit(&self, proxy_name: &str, client_addr: &str) -> Result<(), GatewayError> {
        let config = self.config();
        let now = Instant::now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        prune_history(&mut state, now, Duration::from_secs(config.creation_window_seconds));

        let live_client = state.client_sessions.get(client_addr).copied().unwrap_or(0);
        if live_client >= config.max_sessions_per_client {
            let severity = ratio_severity(live_client + 1, config.max_sessions_per_client);
            let reason = format!(
                "client {client_addr} has {live_client}/{} live sessions",
                config.max_sessions_per_client
            );
            record_violation(
                &mut state,
                client_addr,
                proxy_name,
                ViolationKind::ClientLimit,
                severity,
                &reason,
            );
            return Err(GatewayError::AdmissionRejected(reason));
        }

        let live_proxy = state.proxy_sessions.get(proxy_name).copied().unwrap_or(0);
        if live_proxy >= config.max_sessions_per_proxy {
            let severity = proxy_severity(live_proxy + 1, config.max_sessions_per_proxy);
            let reason = format!(
                "proxy {proxy_name} has {live_proxy}/{} live sessions",
                config.max_sessions_per_proxy
            );
            record_violation(
                &mut state,
                client_addr,
                proxy_name,
                ViolationKind::ProxyLimit,
                severity,
                &reason,
            );
            return Err(GatewayError::AdmissionRejected(reason));
        }

        let recent = state
            .creation_history
            .get(client_addr)
            .map(VecDeque::len)
            .unwrap_or(0);
        let rate_cap = config.max_sessions_per_client + config.burst_allowance;
        if recent >= rate_cap {
            let severity = ratio_severity(recent, rate_cap);
            let reason = format!(
                "client {client_addr} created {recent} sessions in {}s (cap {rate_cap})",
                config.creation_window_seconds
            );
            record_violation(
                &mut state,
                client_addr,
                proxy_name,
                ViolationKind::CreationRate,
                severity,
                &reason,
            );
            return Err(GatewayError::AdmissionRejected(reason));
        }

        // Admitted: reserve the slot and record the creation.
        state
            .creation_history
            .entry(client_addr.to_string())
            .or_default()
            .push_back(now);
        *state
            .client_sessions
            .entry(client_addr.to_string())
            .or_insert(0) += 1;
        *state
            .proxy_sessions
            .entry(proxy_name.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Return a session's slot after close.
    pub fn release(&self, proxy_name: &str, client_addr: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        decrement(&mut state.client_sessions, client_addr);
        decrement(&mut state.proxy_sessions, proxy_name);
    }

    /// Violations recorded within the retention window, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        prune_violations(&mut state, Instant::now());
        state.violations.iter().cloned().collect()
    }

    pub fn status(&self) -> AdmissionStatus {
        let config = self.config();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        prune_violations(&mut state, Instant::now());

        let mut by_severity: HashMap<Severity, usize> = HashMap::new();
        for violation in &state.violations {
            *by_severity.entry(violation.severity).or_insert(0) += 1;
        }
        AdmissionStatus {
            config,
            total_sessions: state.client_sessions.values().sum(),
            sessions_by_proxy: state.proxy_sessions.clone(),
            sessions_by_client: state.client_sessions.clone(),
            violations_last_hour: state.violations.len(),
            violations_by_severity: by_severity,
        }
    }

    /// Forget creation history for one client, or all clients. Returns the
    /// number of histories cleared.
    pub fn clear_history(&self, client_addr: Option<&str>) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match client_addr {
            Some(client) => state.creation_history.remove(client).map(|_| 1).unwrap_or(0),
            None => {
                let cleared = state.creation_history.len();
                state.creation_history.clear();
                cleared
            }
        }
    }
}

fn decrement(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

fn prune_history(state: &mut AdmissionState, now: Instant, window: Duration) {
    state.creation_history.retain(|_, timestamps| {
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        !timestamps.is_empty()
    });
}

fn prune_violations(state: &mut AdmissionState, now: Instant) {
    while let Some(front) = state.violations.front() {
        if now.duration_since(front.recorded) > VIOLATION_WINDOW {
            state.violations.pop_front();
        } else {
            break;
        }
    }
}

fn record_violation(
    state: &mut AdmissionState,
    client_addr: &str,
    proxy_name: &str,
    kind: ViolationKind,
    severity: Severity,
    reason: &str,
) {
    warn!(
        client = client_addr,
        proxy = proxy_name,
        kind = ?kind,
        severity = ?severity,
        reason,
        "admission rejected"
    );
    let now = Instant::now();
    prune_violations(state, now);
    if state.violations.len() >= VIOLATION_CAPACITY {
        state.violations.pop_front();
    }
    state.violations.push_back(Violation {
        at: Utc::now(),
        client_addr: client_addr.to_string(),
        proxy_name: proxy_name.to_string(),
        kind,
        severity,
        reason: reason.to_string(),
        recorded: now,
    });
}

/// Severity by overshoot ratio (client and creation-rate checks).
fn ratio_severity(actual: usize, limit: usize) -> Severity {
    let ratio = actual as f64 / limit.max(1) as f64;
    if ratio > 2.0 {
        Severity::Critical
    } else if ratio > 1.5 {
        Severity::High
    } else if ratio > 1.2 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Proxy saturation starts at Medium: it affects every client.
fn proxy_severity(actual: usize, limit: usize) -> Severity {
    let ratio = actual as f64 / limit.max(1) as f64;
    if ratio > 1.5 {
        Severity::Critical
    } else if ratio > 1.2 {
        Severity::High
    } else {
        Severity::Medium
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_client: usize, per_proxy: usize, burst: usize) -> RateLimitConfig {
        RateLimitConfig {
            max_sessions_per_client: per_client,
            max_sessions_per_proxy: per_proxy,
            creation_window_seconds: 60,
            burst_allowance: burst,
        }
    }

    #[test]
    fn test_client_limit_rejects_with_violation() {
        let admission = AdmissionControl::new(config(2, 50, 3));
        admission.admit("p", "10.0.0.1").unwrap();
        admission.admit("p", "10.0.0.1").unwrap();

        let err = admission.admit("p", "10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionRejected(_)));

        let violations = admission.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ClientLimit);
        assert_eq!(violations[0].client_addr, "10.0.0.1");
    }

    #[test]
    fn test_other_clients_unaffected_by_client_limit() {
        let admission = AdmissionControl::new(config(1, 50, 3));
        admission.admit("p", "10.0.0.1").unwrap();
        assert!(admission.admit("p", "10.0.0.1").is_err());
        admission.admit("p", "10.0.0.2").unwrap();
    }

    #[test]
    fn test_proxy_limit_rejects() {
        let admission = AdmissionControl::new(config(10, 2, 3));
        admission.admit("p", "10.0.0.1").unwrap();
        admission.admit("p", "10.0.0.2").unwrap();

        let err = admission.admit("p", "10.0.0.3").unwrap_err();
        assert!(err.to_string().contains("proxy p"));
        let violations = admission.violations();
        assert_eq!(violations[0].kind, ViolationKind::ProxyLimit);
        assert!(violations[0].severity >= Severity::Medium);

        // Another proxy still has room.
        admission.admit("q", "10.0.0.3").unwrap();
    }

    #[test]
    fn test_release_frees_slots() {
        let admission = AdmissionControl::new(config(1, 1, 3));
        admission.admit("p", "10.0.0.1").unwrap();
        assert!(admission.admit("p", "10.0.0.1").is_err());

        admission.release("p", "10.0.0.1");
        admission.admit("p", "10.0.0.1").unwrap();
    }

    #[test]
    fn test_creation_rate_with_burst() {
        // Live-session caps are loose; only the window check binds.
        let admission = AdmissionControl::new(config(3, 100, 1));
        // Churn sessions: create and release so live counts stay at zero
        // while the creation history accumulates.
        for _ in 0..4 {
            admission.admit("p", "10.0.0.9").unwrap();
            admission.release("p", "10.0.0.9");
        }
        // History is now 4 = cap(3) + burst(1); the next creation exceeds it.
        let err = admission.admit("p", "10.0.0.9").unwrap_err();
        assert!(err.to_string().contains("sessions in"));
        assert_eq!(
            admission.violations().last().unwrap().kind,
            ViolationKind::CreationRate
        );
    }

    #[test]
    fn test_clear_history_resets_rate_state() {
        let admission = AdmissionControl::new(config(2, 100, 0));
        admission.admit("p", "c").unwrap();
        admission.release("p", "c");
        admission.admit("p", "c").unwrap();
        admission.release("p", "c");
        assert!(admission.admit("p", "c").is_err());

        assert_eq!(admission.clear_history(Some("c")), 1);
        admission.admit("p", "c").unwrap();
    }

    #[test]
    fn test_severity_scaling() {
        assert_eq!(ratio_severity(3, 10), Severity::Low);
        assert_eq!(ratio_severity(13, 10), Severity::Medium);
        assert_eq!(ratio_severity(16, 10), Severity::High);
        assert_eq!(ratio_severity(25, 10), Severity::Critical);
        assert_eq!(proxy_severity(51, 50), Severity::Medium);
    }

    #[test]
    fn test_status_counts() {
        let admission = AdmissionControl::new(config(5, 5, 3));
        admission.admit("p", "a").unwrap();
        admission.admit("p", "b").unwrap();
        admission.admit("q", "a").unwrap();

        let status = admission.status();
        assert_eq!(status.total_sessions, 3);
        assert_eq!(status.sessions_by_proxy["p"], 2);
        assert_eq!(status.sessions_by_client["a"], 2);
        assert_eq!(status.violations_last_hour, 0);
    }

    #[test]
    fn test_runtime_config_swap() {
        let admission = AdmissionControl::new(config(1, 50, 3));
        admission.admit("p", "c").unwrap();
        assert!(admission.admit("p", "c").is_err());

        admission.set_config(config(5, 50, 3));
        admission.admit("p", "c").unwrap();
    }
}
