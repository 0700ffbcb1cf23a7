//! In-memory lookup from (workspace, container) to a reachable address.
//!
//! Entries are derived from container state after the lifecycle confirmed a
//! transition. The store stays authoritative; a missing entry means "do not
//! route".

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A running container as the router sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    /// Ports that are active and public.
    pub ports: BTreeSet<u16>,
}

#[derive(Clone, Default)]
pub struct EndpointRegistry {
    inner: Arc<RwLock<HashMap<(i64, String), Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every entry of `workspace_id` with `endpoints`.
    pub fn publish(&self, workspace_id: i64, endpoints: impl IntoIterator<Item = (String, Endpoint)>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|(ws, _), _| *ws != workspace_id);
        for (container, endpoint) in endpoints {
            debug!(workspace_id, %container, address = %endpoint.address, "endpoint published");
            map.insert((workspace_id, container), endpoint);
        }
    }

    pub fn remove_workspace(&self, workspace_id: i64) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|(ws, _), _| *ws != workspace_id);
    }

    /// Address for `port` on the container, if that port is currently published.
    pub fn lookup(&self, workspace_id: i64, container: &str, port: u16) -> Option<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&(workspace_id, container.to_string()))
            .filter(|endpoint| endpoint.ports.contains(&port))
            .map(|endpoint| endpoint.address.clone())
    }

    pub fn contains_workspace(&self, workspace_id: i64) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.keys().any(|(ws, _)| *ws == workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, ports: &[u16]) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            ports: ports.iter().copied().collect(),
        }
    }

    #[test]
    fn test_lookup_requires_published_port() {
        let registry = EndpointRegistry::new();
        registry.publish(1, [("development".to_string(), endpoint("10.0.0.2", &[3000, 2222]))]);

        assert_eq!(registry.lookup(1, "development", 3000).as_deref(), Some("10.0.0.2"));
        assert_eq!(registry.lookup(1, "development", 8080), None);
        assert_eq!(registry.lookup(1, "db", 3000), None);
        assert_eq!(registry.lookup(2, "development", 3000), None);
    }

    #[test]
    fn test_publish_replaces_workspace_entries_only() {
        let registry = EndpointRegistry::new();
        registry.publish(1, [("web".to_string(), endpoint("10.0.0.2", &[80]))]);
        registry.publish(2, [("web".to_string(), endpoint("10.0.0.3", &[80]))]);
        registry.publish(1, [("api".to_string(), endpoint("10.0.0.4", &[80]))]);

        assert_eq!(registry.lookup(1, "web", 80), None);
        assert_eq!(registry.lookup(1, "api", 80).as_deref(), Some("10.0.0.4"));
        assert_eq!(registry.lookup(2, "web", 80).as_deref(), Some("10.0.0.3"));

        registry.remove_workspace(1);
        assert!(!registry.contains_workspace(1));
        assert!(registry.contains_workspace(2));
    }
}
