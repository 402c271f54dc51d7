//! SSE-style event stream fan-out.

pub mod envelope;
pub mod hub;

pub use envelope::{EnvelopeKind, StreamEnvelope};
pub use hub::{StreamHub, Subscription};

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::config::RefreshConfig;

fn stream_key(domain: &str, scope: &str) -> String {
    format!("{domain}\u{1}{scope}")
}

/// Per-subsystem map of active stream hubs, one per `(domain, scope)` that
/// has ever been subscribed to or published on.
pub struct StreamRegistry {
    hubs: RwLock<HashMap<String, StreamHub>>,
    ring_capacity: usize,
    subscriber_buffer_size: usize,
    max_subscribers: usize,
}

impl StreamRegistry {
    pub fn new(config: &RefreshConfig) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            ring_capacity: config.stream_ring_buffer_size,
            subscriber_buffer_size: config.stream_subscriber_buffer_size,
            max_subscribers: config.stream_max_subscribers,
        }
    }

    /// Looks up the hub for `(domain, scope)`, creating one on first use.
    pub async fn get_or_create(&self, domain: &str, scope: &str) -> StreamHub {
        let key = stream_key(domain, scope);
        if let Some(hub) = self.hubs.read().await.get(&key) {
            return hub.clone();
        }
        let mut hubs = self.hubs.write().await;
        hubs.entry(key)
            .or_insert_with(|| StreamHub::new(self.ring_capacity, self.subscriber_buffer_size, self.max_subscribers))
            .clone()
    }

    /// Looks up an existing hub without creating one; used by the manual
    /// refresh queue to decide whether a `reset` envelope even has anyone
    /// to reach.
    pub async fn get(&self, domain: &str, scope: &str) -> Option<StreamHub> {
        self.hubs.read().await.get(&stream_key(domain, scope)).cloned()
    }

    pub async fn close_all(&self, reason: &str) {
        let hubs = self.hubs.read().await;
        for hub in hubs.values() {
            hub.close_all(reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_the_same_hub_on_repeated_lookup() {
        let registry = StreamRegistry::new(&RefreshConfig::for_tests());
        let hub_a = registry.get_or_create("namespace-workloads", "namespace:team-a").await;
        hub_a.publish(EnvelopeKind::Delta, serde_json::Value::Null).await;

        let hub_b = registry.get_or_create("namespace-workloads", "namespace:team-a").await;
        let missed = hub_b.resume(0).await;
        assert_eq!(missed.len(), 1, "second lookup should see the same hub's published envelope");
    }

    #[tokio::test]
    async fn get_returns_none_before_any_subscribe_or_publish() {
        let registry = StreamRegistry::new(&RefreshConfig::for_tests());
        assert!(registry.get("namespace-workloads", "namespace:team-a").await.is_none());
    }

    #[tokio::test]
    async fn distinct_scopes_get_distinct_hubs() {
        let registry = StreamRegistry::new(&RefreshConfig::for_tests());
        let hub_a = registry.get_or_create("namespace-workloads", "namespace:team-a").await;
        hub_a.publish(EnvelopeKind::Delta, serde_json::Value::Null).await;

        let hub_b = registry.get_or_create("namespace-workloads", "namespace:team-b").await;
        assert!(hub_b.resume(0).await.is_empty());
    }
}
