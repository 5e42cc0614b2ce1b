/// Request ingress for the berth gateway.
///
/// Routes inbound connections on the listen address:
/// - `GET /{proxy}{endpoint}` with `Accept: text/event-stream` opens an
///   EVENT session; plain GET is a warmup probe
/// - `POST /{proxy}{endpoint}` is a single HTTP-transport call
/// - `POST /{proxy}/messages?sessionId=X` and `POST /messages?sessionId=X`
///   dispatch into an existing EVENT session
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::{AppState, EngineHealth};
