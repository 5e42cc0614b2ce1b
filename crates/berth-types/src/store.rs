/// Persistent configuration store.
///
/// Two JSON documents under a config directory: `backends.json` maps
/// backend name to [`BackendConfig`], `proxies.json` maps proxy name to
/// [`ProxyConfig`]. An optional `gateway.json` carries runtime tuning.
/// The store reads at startup and on explicit reload; all writes go
/// through `put_*`/`delete_*` and persist immediately. Imported legacy
/// documents may use camelCase field names; the serde aliases on the
/// config types normalize them on the way in.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{BackendConfig, GatewayConfig, ProxyConfig, TransportKind};
use crate::errors::GatewayError;

const BACKENDS_FILE: &str = "backends.json";
const PROXIES_FILE: &str = "proxies.json";
const GATEWAY_FILE: &str = "gateway.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendsDoc {
    #[serde(default, alias = "mcpServers")]
    mcp_servers: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProxiesDoc {
    #[serde(default, alias = "mcpProxies")]
    mcp_proxies: BTreeMap<String, ProxyConfig>,
}

/// File-backed configuration store.
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| GatewayError::Config(format!("create config dir {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn read_doc<T: Default + for<'de> Deserialize<'de>>(
        &self,
        file: &str,
    ) -> Result<T, GatewayError> {
        let path = self.path(file);
        if !path.exists() {
            info!(path = %path.display(), "config file absent, starting empty");
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))
    }

    fn write_doc<T: Serialize>(&self, file: &str, doc: &T) -> Result<(), GatewayError> {
        let path = self.path(file);
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| GatewayError::Config(format!("encode {}: {e}", path.display())))?;
        std::fs::write(&path, content)
            .map_err(|e| GatewayError::Config(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Load all backend configs, validated, names filled from map keys.
    pub fn load_backends(&self) -> Result<BTreeMap<String, BackendConfig>, GatewayError> {
        let mut doc: BackendsDoc = self.read_doc(BACKENDS_FILE)?;
        for (name, cfg) in doc.mcp_servers.iter_mut() {
            cfg.name = name.clone();
            validate_backend(cfg)?;
        }
        info!(count = doc.mcp_servers.len(), "loaded backend configurations");
        Ok(doc.mcp_servers)
    }

    /// Load all proxy configs, validated against the given backends.
    pub fn load_proxies(
        &self,
        backends: &BTreeMap<String, BackendConfig>,
    ) -> Result<BTreeMap<String, ProxyConfig>, GatewayError> {
        let mut doc: ProxiesDoc = self.read_doc(PROXIES_FILE)?;
        for (name, cfg) in doc.mcp_proxies.iter_mut() {
            cfg.name = name.clone();
            validate_proxy(cfg, backends)?;
        }
        info!(count = doc.mcp_proxies.len(), "loaded proxy configurations");
        Ok(doc.mcp_proxies)
    }

    /// Load the runtime tuning document; defaults when absent.
    pub fn load_gateway(&self) -> Result<GatewayConfig, GatewayError> {
        self.read_doc(GATEWAY_FILE)
    }

    pub fn put_backend(&self, cfg: &BackendConfig) -> Result<(), GatewayError> {
        validate_backend(cfg)?;
        let mut doc: BackendsDoc = self.read_doc(BACKENDS_FILE)?;
        doc.mcp_servers.insert(cfg.name.clone(), cfg.clone());
        self.write_doc(BACKENDS_FILE, &doc)
    }

    pub fn delete_backend(&self, name: &str) -> Result<bool, GatewayError> {
        let mut doc: BackendsDoc = self.read_doc(BACKENDS_FILE)?;
        let removed = doc.mcp_servers.remove(name).is_some();
        if removed {
            self.write_doc(BACKENDS_FILE, &doc)?;
        }
        Ok(removed)
    }

    pub fn put_proxy(
        &self,
        cfg: &ProxyConfig,
        backends: &BTreeMap<String, BackendConfig>,
    ) -> Result<(), GatewayError> {
        validate_proxy(cfg, backends)?;
        let mut doc: ProxiesDoc = self.read_doc(PROXIES_FILE)?;
        doc.mcp_proxies.insert(cfg.name.clone(), cfg.clone());
        self.write_doc(PROXIES_FILE, &doc)
    }

    pub fn delete_proxy(&self, name: &str) -> Result<bool, GatewayError> {
        let mut doc: ProxiesDoc = self.read_doc(PROXIES_FILE)?;
        let removed = doc.mcp_proxies.remove(name).is_some();
        if removed {
            self.write_doc(PROXIES_FILE, &doc)?;
        }
        Ok(removed)
    }

    /// Import a legacy backend document (`{"mcpServers": {...}}` in either
    /// casing). Entries that fail validation are skipped. Returns
    /// `(imported, failed)`.
    pub fn import_backends(&self, document: &Value) -> Result<(usize, usize), GatewayError> {
        let doc: BackendsDoc = serde_json::from_value(document.clone())
            .map_err(|e| GatewayError::Config(format!("parse import document: {e}")))?;
        let mut existing: BackendsDoc = self.read_doc(BACKENDS_FILE)?;
        let mut imported = 0;
        let mut failed = 0;
        for (name, mut cfg) in doc.mcp_servers {
            cfg.name = name.clone();
            match validate_backend(&cfg) {
                Ok(()) => {
                    existing.mcp_servers.insert(name, cfg);
                    imported += 1;
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping invalid backend in import");
                    failed += 1;
                }
            }
        }
        self.write_doc(BACKENDS_FILE, &existing)?;
        info!(imported, failed, "backend import completed");
        Ok((imported, failed))
    }
}

/// Validate a single backend config.
pub fn validate_backend(cfg: &BackendConfig) -> Result<(), GatewayError> {
    if cfg.name.trim().is_empty() {
        return Err(GatewayError::Config("backend name must not be empty".to_string()));
    }
    match cfg.transport {
        TransportKind::Local => {
            if cfg.command.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "backend '{}': local transport requires a command",
                    cfg.name
                )));
            }
        }
        TransportKind::Event | TransportKind::Http => {
            if cfg.url.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                return Err(GatewayError::Config(format!(
                    "backend '{}': {} transport requires a url",
                    cfg.name, cfg.transport
                )));
            }
        }
    }
    if cfg.depends_on.contains(&cfg.name) {
        return Err(GatewayError::Config(format!(
            "backend '{}' depends on itself",
            cfg.name
        )));
    }
    Ok(())
}

/// Validate a proxy config against the known backends.
pub fn validate_proxy(
    cfg: &ProxyConfig,
    backends: &BTreeMap<String, BackendConfig>,
) -> Result<(), GatewayError> {
    if cfg.name.trim().is_empty() {
        return Err(GatewayError::Config("proxy name must not be empty".to_string()));
    }
    if !cfg.endpoint.starts_with('/') {
        return Err(GatewayError::Config(format!(
            "proxy '{}': endpoint must begin with '/' (got {:?})",
            cfg.name, cfg.endpoint
        )));
    }
    if !backends.contains_key(&cfg.backend_name) {
        return Err(GatewayError::Config(format!(
            "proxy '{}' references unknown backend '{}'",
            cfg.name, cfg.backend_name
        )));
    }
    Ok(())
}

/// Validate every backend's `depends_on` edges point at known backends.
pub fn validate_dependencies(
    backends: &BTreeMap<String, BackendConfig>,
) -> Result<(), GatewayError> {
    for (name, cfg) in backends {
        for dep in &cfg.depends_on {
            if !backends.contains_key(dep) {
                return Err(GatewayError::Config(format!(
                    "backend '{name}' depends on unknown backend '{dep}'"
                )));
            }
        }
    }
    Ok(())
}

// ============================================================
// Tests
// ============================================================
