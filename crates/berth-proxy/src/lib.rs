/// Proxy engine for the berth gateway.
///
/// Each proxy re-exposes one backend under a client-facing endpoint with a
/// filtered tool catalog. The engine routes JSON-RPC requests, answers
/// `initialize` and `tools/list` locally, and forwards the rest.
pub mod engine;

pub use engine::{ProxyEngine, ProxySnapshot, ProxyState};
