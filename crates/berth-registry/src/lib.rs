/// Backend registry for the berth gateway.
///
/// Owns the set of live backend records and mediates all access to their
/// transport clients:
/// - lifecycle state machine (Stopped → Starting → Running → Verified)
/// - MCP handshake with protocol-version preference
/// - tool-catalog discovery and re-verification
/// - auto-start orchestration in dependency order
pub mod orchestrator;
pub mod registry;

pub use orchestrator::{topo_sort, StartReport};
pub use registry::{Backend, BackendRegistry, BackendSnapshot, BackendState};
