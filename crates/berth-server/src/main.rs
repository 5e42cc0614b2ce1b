//! berth: a unified gateway for MCP servers.
//!
//! Exit codes: 0 clean shutdown, 1 fatal misconfiguration (dependency
//! cycle, bind failure, unloadable config), 2 unrecoverable internal error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use berth_proxy::ProxyEngine;
use berth_registry::{orchestrator, BackendRegistry, StartReport};
use berth_server::{router, AppState, EngineHealth};
use berth_session::SessionManager;
use berth_types::store::{validate_dependencies, ConfigStore};
use berth_types::GatewayError;

const GATEWAY_NAME: &str = "berth";

#[derive(Debug, Parser)]
#[command(name = "berth", version, about = "Unified MCP gateway")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0", env = "BERTH_HOST")]
    host: String,

    /// Listen port.
    #[arg(long, default_value_t = 8000, env = "BERTH_PORT")]
    port: u16,

    /// Directory holding backends.json, proxies.json, and gateway.json.
    #[arg(long, default_value = "config", env = "BERTH_CONFIG_DIR")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ GatewayError::Config(_)) => {
            error!(error = %e, "fatal misconfiguration");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "unrecoverable error");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<(), GatewayError> {
    let store = ConfigStore::open(&args.config_dir)?;
    let backends = store.load_backends()?;
    let proxies = store.load_proxies(&backends)?;
    let gateway = store.load_gateway()?;
    validate_dependencies(&backends)?;

    let registry = BackendRegistry::new(GATEWAY_NAME, env!("CARGO_PKG_VERSION"));
    registry.load(backends.values().cloned()).await;

    let engine = ProxyEngine::new(registry.clone(), GATEWAY_NAME, env!("CARGO_PKG_VERSION"));
    engine.load(proxies.values().cloned()).await;

    let sessions = SessionManager::new(
        gateway.session.clone(),
        gateway.rate_limit.clone(),
        gateway.heartbeat.clone(),
    );

    // Bring backends up in dependency order; a cycle is fatal before any
    // child process is spawned.
    let (backends_started, backends_failed) =
        orchestrator::auto_start_backends(&registry, &backends).await?;
    let (proxies_started, proxies_failed) = engine.auto_start().await;
    let report = StartReport {
        backends_started,
        backends_failed,
        proxies_started,
        proxies_failed,
    };
    info!(
        backends_started = report.backends_started,
        backends_failed = report.backends_failed,
        proxies_started = report.proxies_started,
        proxies_failed = report.proxies_failed,
        "startup complete"
    );

    engine.spawn_refresh_task();
    sessions.spawn_reaper(Arc::new(EngineHealth(engine.clone())));

    let state = AppState::new(engine, sessions.clone());
    let app = router(state);

    let listen = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| GatewayError::Config(format!("bind {listen}: {e}")))?;
    info!(listen = %listen, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("server error: {e}")))?;

    // Drain sessions, then stop backends so child processes terminate.
    for session in sessions.stats().sessions {
        sessions.close(&session.session_id, "gateway shutdown").await;
    }
    for name in registry.names().await {
        if let Err(e) = registry.stop(&name).await {
            error!(backend = %name, error = %e, "error stopping backend at shutdown");
        }
    }
    info!("gateway stopped");
    Ok(())
}
