/// Session management for EVENT proxies.
///
/// - **manager**: session lifecycle, bounded pending queues, idle reap
/// - **heartbeat**: adaptive liveness pings and per-session metrics
/// - **admission**: per-client and per-proxy caps with violation tracking
pub mod admission;
pub mod heartbeat;
pub mod manager;

pub use admission::{AdmissionControl, Severity, Violation, ViolationKind};
pub use heartbeat::HeartbeatController;
pub use manager::{BackendHealth, OutboundEvent, SessionManager, SessionTicket};
