//! Auto-start orchestration.
//!
//! At process startup backends are brought up in dependency order; a cycle
//! in `depends_on` is a fatal misconfiguration. Individual start failures
//! are recorded and do not block the remaining backends.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{error, info};

use berth_types::{BackendConfig, GatewayError};

use crate::registry::BackendRegistry;

/// Aggregate outcome of the startup pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StartReport {
    pub backends_started: usize,
    pub backends_failed: usize,
    pub proxies_started: usize,
    pub proxies_failed: usize,
}

/// Order backends so that every backend comes after its dependencies
/// (Kahn's algorithm). A cycle is a `Config` error naming the members.
pub fn topo_sort(configs: &BTreeMap<String, BackendConfig>) -> Result<Vec<String>, GatewayError> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, config) in configs {
        indegree.entry(name).or_insert(0);
        for dep in &config.depends_on {
            if !configs.contains_key(dep) {
                return Err(GatewayError::Config(format!(
                    "backend '{name}' depends on unknown backend '{dep}'"
                )));
            }
            *indegree.entry(name).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut ordered = Vec::with_capacity(configs.len());

    while let Some(name) = queue.pop_front() {
        ordered.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if ordered.len() != configs.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(GatewayError::Config(format!(
            "dependency cycle among backends: {}",
            stuck.join(", ")
        )));
    }

    Ok(ordered)
}

/// Start every `auto_start` backend in dependency order, awaiting each so
/// that dependents see their dependencies settled (Verified or failed).
pub async fn auto_start_backends(
    registry: &BackendRegistry,
    configs: &BTreeMap<String, BackendConfig>,
) -> Result<(usize, usize), GatewayError> {
    let order = topo_sort(configs)?;
    let mut started = 0;
    let mut failed = 0;

    for name in order {
        let config = &configs[&name];
        if !config.auto_start {
            continue;
        }
        info!(backend = %name, "auto-starting backend");
        match registry.start(&name).await {
            Ok(()) => started += 1,
            Err(e) => {
                error!(backend = %name, error = %e, "backend auto-start failed");
                failed += 1;
            }
        }
    }

    Ok((started, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(name: &str, deps: &[&str], auto_start: bool) -> (String, BackendConfig) {
        let config: BackendConfig = serde_json::from_value(json!({
            "name": name,
            "transport": "local",
            "command": "true",
            "auto_start": auto_start,
            "depends_on": deps,
        }))
        .unwrap();
        (name.to_string(), config)
    }

    #[test]
    fn test_topo_sort_orders_dependencies_first() {
        let configs = BTreeMap::from([
            backend("web", &["auth", "db"], true),
            backend("auth", &["db"], true),
            backend("db", &[], true),
        ]);
        let order = topo_sort(&configs).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("db") < pos("auth"));
        assert!(pos("auth") < pos("web"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_topo_sort_detects_cycle() {
        let configs = BTreeMap::from([
            backend("a", &["b"], true),
            backend("b", &["a"], true),
            backend("c", &[], true),
        ]);
        let err = topo_sort(&configs).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cycle"));
        assert!(text.contains('a') && text.contains('b'));
    }

    #[test]
    fn test_topo_sort_rejects_unknown_dependency() {
        let configs = BTreeMap::from([backend("a", &["ghost"], true)]);
        assert!(topo_sort(&configs).is_err());
    }

    #[tokio::test]
    async fn test_failures_do_not_block_remaining_backends() {
        let registry = BackendRegistry::new("berth", "0.1.0");
        let (_, mut bad) = backend("bad", &[], true);
        bad.command = "no-such-binary".to_string();
        let (_, good) = backend("good", &[], true);
        // "good" needs a real MCP fixture to verify, so use a command that
        // answers the handshake.
        let good = fixture(good.name.clone());

        let configs = BTreeMap::from([
            ("bad".to_string(), bad.clone()),
            ("good".to_string(), good.clone()),
        ]);
        registry.load([bad, good]).await;

        let (started, failed) = auto_start_backends(&registry, &configs).await.unwrap();
        assert_eq!(started, 1);
        assert_eq!(failed, 1);
        registry.stop("good").await.unwrap();
    }

    fn fixture(name: String) -> BackendConfig {
        let script = r#"while IFS= read -r line; do
               id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
               case "$line" in
                   *'"initialize"'*)
                       printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"f","version":"1"}}}\n' "$id" ;;
                   *'"tools/list"'*)
                       printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t"}]}}\n' "$id" ;;
                   *)
                       [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
               esac
           done"#;
        serde_json::from_value(json!({
            "name": name,
            "transport": "local",
            "command": "sh",
            "args": ["-c", script],
            "auto_start": true,
        }))
        .unwrap()
    }
}
