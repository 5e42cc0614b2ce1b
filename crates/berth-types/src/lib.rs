/// Shared types, traits, and errors for the berth MCP gateway.
///
/// This crate is the foundation that all other berth crates depend on.
/// It contains:
/// - **Wire types** (`messages`) for JSON-RPC 2.0 / MCP envelopes and tools
/// - **Compliance normalization** (`compliance`) applied at the protocol boundary
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`) and the persistent **config store** (`store`)
/// - **Trait contracts** (`traits`) that define the transport seam
pub mod compliance;
pub mod config;
pub mod errors;
pub mod messages;
pub mod store;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use config::*;
pub use errors::GatewayError;
pub use messages::*;
pub use traits::TransportClient;

/// Newest MCP revision the gateway speaks.
pub const PROTOCOL_VERSION_PRIMARY: &str = "2025-03-26";
/// Legacy revision accepted for older clients and backends.
pub const PROTOCOL_VERSION_FALLBACK: &str = "2024-11-05";
/// Recognized protocol revisions, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] =
    [PROTOCOL_VERSION_PRIMARY, PROTOCOL_VERSION_FALLBACK];
