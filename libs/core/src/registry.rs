//! Domain registry: `name -> DomainConfig`, last registration
//! wins, insertion order preserved for diagnostics.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::scope::DomainCategory;
use crate::snapshot::builder::DomainBuilder;

/// Everything the snapshot service needs to know about a registered domain.
#[derive(Clone)]
pub struct DomainConfig {
    pub name: String,
    pub category: DomainCategory,
    /// When true, the registered builder always returns `PermissionDenied`
    /// without ever touching the Kubernetes API.
    pub permission_denied: bool,
    /// Whether this domain reads from informer list/watch caches (almost
    /// always true; kept for domains that are pure aggregation of others).
    pub list_watch: bool,
    pub builder: Arc<dyn DomainBuilder>,
}

impl DomainConfig {
    pub fn new(
        name: impl Into<String>,
        category: DomainCategory,
        builder: Arc<dyn DomainBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            permission_denied: false,
            list_watch: true,
            builder,
        }
    }

    pub fn permission_denied(mut self, builder: Arc<dyn DomainBuilder>) -> Self {
        self.permission_denied = true;
        self.list_watch = false;
        self.builder = builder;
        self
    }
}

/// Registered domains for one cluster subsystem. Registration is
/// idempotent-by-name: the last call to `register` for a given name wins,
/// replacing any prior entry in place (insertion order is preserved so the
/// first registration's position is kept on overwrite, matching how a
/// `HashMap` + side vector would behave if we only ever appended new names).
pub struct DomainRegistry {
    order: RwLock<Vec<String>>,
    configs: RwLock<HashMap<String, DomainConfig>>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            order: RwLock::new(Vec::new()),
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, config: DomainConfig) {
        let mut configs = self.configs.write().await;
        if !configs.contains_key(&config.name) {
            self.order.write().await.push(config.name.clone());
        }
        configs.insert(config.name.clone(), config);
    }

    pub async fn get(&self, name: &str) -> Option<DomainConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Registered domains in insertion order.
    pub async fn list(&self) -> Vec<DomainConfig> {
        let order = self.order.read().await;
        let configs = self.configs.read().await;
        order
            .iter()
            .filter_map(|name| configs.get(name).cloned())
            .collect()
    }
}
