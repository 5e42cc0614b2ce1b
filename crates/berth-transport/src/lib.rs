/// Transport clients for the berth gateway.
///
/// One uniform [`TransportClient`] interface over the three MCP transports:
/// - **LOCAL** (`stdio`): child process, newline-delimited JSON-RPC
/// - **EVENT** (`sse`): server-push event stream + companion POST channel
/// - **HTTP** (`http`): one POST per JSON-RPC envelope
pub mod http;
pub mod retry;
pub mod sse;
pub mod stdio;

mod correlate;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use berth_types::{BackendConfig, GatewayError, TransportClient, TransportKind};

/// Connect to a backend with the transport its config names.
///
/// `url_override` substitutes the EVENT stream URL when the registry probes
/// endpoint candidates.
pub async fn connect_backend(
    config: &BackendConfig,
    url_override: Option<&str>,
    cancel: CancellationToken,
) -> Result<Arc<dyn TransportClient>, GatewayError> {
    match config.transport {
        TransportKind::Local => {
            let client = stdio::StdioClient::spawn(config, cancel).await?;
            Ok(Arc::new(client))
        }
        TransportKind::Event => {
            let url = url_override
                .or(config.url.as_deref())
                .ok_or_else(|| {
                    GatewayError::Config(format!("backend '{}' has no url", config.name))
                })?;
            let client = sse::SseClient::connect(url, &config.headers, cancel).await?;
            Ok(Arc::new(client))
        }
        TransportKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| {
                GatewayError::Config(format!("backend '{}' has no url", config.name))
            })?;
            let client = http::HttpClient::new(url, &config.headers)?;
            Ok(Arc::new(client))
        }
    }
}
