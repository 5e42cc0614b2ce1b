//! Shared application state wired once at startup.

use std::time::Duration;

use async_trait::async_trait;

use berth_proxy::ProxyEngine;
use berth_registry::BackendRegistry;
use berth_session::{manager::BackendHealth, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub engine: ProxyEngine,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(engine: ProxyEngine, sessions: SessionManager) -> Self {
        Self { engine, sessions }
    }

    pub fn registry(&self) -> &BackendRegistry {
        self.engine.registry()
    }
}

/// Adapter giving the session reaper a view of backend health through the
/// proxy engine.
pub struct EngineHealth(pub ProxyEngine);

#[async_trait]
impl BackendHealth for EngineHealth {
    async fn not_verified_for(&self, proxy_name: &str) -> Option<Duration> {
        self.0.backend_not_verified_for(proxy_name).await
    }
}
