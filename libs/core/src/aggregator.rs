//! The multi-cluster aggregator: the only place in the core that ever sees
//! a `clusters=id1,id2|<inner>` scope prefix. Every per-cluster
//! `ClusterSubsystem` only ever sees the unwrapped inner scope.

use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use tokio::sync::{mpsc, RwLock};

use crate::config::{Clock, RefreshConfig};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::scope::{ClusterId, Scope};
use crate::snapshot::{BuildOptions, Snapshot};
use crate::stream::StreamEnvelope;
use crate::subsystem::ClusterSubsystem;

/// Resolves which clusters a request targets and what inner scope to hand
/// each subsystem. A `clusters=` scope prefix always wins over the
/// out-of-band `cluster_param`; a request carrying neither is rejected
/// before any subsystem is consulted.
fn resolve_targets(scope: Scope, cluster_param: Option<ClusterId>) -> Result<(Vec<ClusterId>, Scope)> {
    match scope {
        Scope::Clusters { ids, inner } => Ok((ids, *inner)),
        other => match cluster_param {
            Some(id) => Ok((vec![id], other)),
            None => Err(Error::MissingClusterScope),
        },
    }
}

/// Routes requests to per-cluster subsystems keyed by `ClusterId`, fans
/// snapshot builds out and merges the results, and tags fanned-in stream
/// envelopes with their originating cluster.
pub struct Aggregator {
    subsystems: RwLock<HashMap<ClusterId, Arc<ClusterSubsystem>>>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl Aggregator {
    pub fn new(config: RefreshConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(config, clock, Arc::new(Metrics::default()))
    }

    /// Shares a caller-constructed [`Metrics`] (typically one that already
    /// folds in the Kubernetes client's own request metrics, per the
    /// `new_client_with_metrics` registry convention) across every cluster
    /// this aggregator routes to, so one `/metrics` scrape covers them all.
    pub fn with_metrics(config: RefreshConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            subsystems: RwLock::new(HashMap::new()),
            config,
            clock,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// `NewSubsystem(clientBundle)`: builds and registers a subsystem for
    /// `cluster_id`, replacing any prior subsystem under the same id
    /// (the caller is expected to have shut the old one down first).
    pub async fn add_cluster(&self, cluster_id: ClusterId, client: Client, metrics_available: bool) {
        let subsystem = Arc::new(
            ClusterSubsystem::with_metrics(
                cluster_id.clone(),
                client,
                metrics_available,
                self.config.clone(),
                self.clock.clone(),
                self.metrics.clone(),
            )
            .await,
        );
        self.subsystems.write().await.insert(cluster_id, subsystem);
    }

    /// Shuts the subsystem down (aborting its informers, closing its
    /// streams) and removes it from routing. In-flight requests already
    /// past the routing lookup complete as best-effort; any request
    /// arriving afterward sees `ClusterNotActive`.
    pub async fn remove_cluster(&self, cluster_id: &ClusterId) {
        let removed = self.subsystems.write().await.remove(cluster_id);
        if let Some(subsystem) = removed {
            subsystem.shutdown().await;
        }
    }

    pub async fn active_clusters(&self) -> Vec<ClusterId> {
        self.subsystems.read().await.keys().cloned().collect()
    }

    /// Looks up the routed subsystem for `cluster_id` directly, for callers
    /// that already have an explicit cluster id in hand (e.g. a manual
    /// refresh submission) rather than a scope string to parse.
    pub async fn subsystem(&self, cluster_id: &ClusterId) -> Option<Arc<ClusterSubsystem>> {
        self.subsystems.read().await.get(cluster_id).cloned()
    }

    /// `Snapshot(domain, scope, options) -> {clusterId -> SnapshotOrError}`.
    /// Per-cluster errors (including `ClusterNotActive` for a cluster id
    /// named in the scope but no longer routed) never fail the aggregate
    /// call; only a missing cluster identifier altogether does.
    pub async fn snapshot(
        &self,
        domain: &str,
        raw_scope: &str,
        cluster_param: Option<ClusterId>,
        options: BuildOptions,
    ) -> Result<HashMap<ClusterId, Result<Snapshot>>> {
        let scope = Scope::parse(raw_scope)?;
        let (cluster_ids, inner) = resolve_targets(scope, cluster_param)?;

        let subsystems = self.subsystems.read().await;
        let mut results = HashMap::with_capacity(cluster_ids.len());
        for cluster_id in cluster_ids {
            let outcome = match subsystems.get(&cluster_id) {
                Some(subsystem) => subsystem.snapshot(domain, inner.clone(), options).await,
                None => Err(Error::ClusterNotActive(cluster_id.to_string())),
            };
            results.insert(cluster_id, outcome);
        }

        Ok(results)
    }

    /// `Stream(domain, scope) -> fanned-in envelope receiver`. Spawns one
    /// forwarding task per targeted cluster; each envelope is tagged with
    /// its originating `clusterId` before being merged onto the single
    /// returned channel. Sequence numbers stay per-cluster: a subscriber
    /// tracks `(clusterId, sequence)`, never a global sequence.
    pub async fn stream(
        &self,
        domain: &str,
        raw_scope: &str,
        cluster_param: Option<ClusterId>,
    ) -> Result<mpsc::Receiver<(ClusterId, Result<StreamEnvelope>)>> {
        let scope = Scope::parse(raw_scope)?;
        let (cluster_ids, inner) = resolve_targets(scope, cluster_param)?;

        let (tx, rx) = mpsc::channel(256);
        let subsystems = self.subsystems.read().await;
        for cluster_id in cluster_ids {
            let Some(subsystem) = subsystems.get(&cluster_id).cloned() else {
                let _ = tx.send((cluster_id.clone(), Err(Error::ClusterNotActive(cluster_id.to_string())))).await;
                continue;
            };
            let domain = domain.to_string();
            let inner = inner.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut subscription = match subsystem.stream(&domain, inner, None).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        let _ = tx.send((cluster_id.clone(), Err(e))).await;
                        return;
                    }
                };
                for envelope in subscription.replay.drain(..) {
                    if tx.send((cluster_id.clone(), Ok(envelope))).await.is_err() {
                        return;
                    }
                }
                while let Some(envelope) = subscription.recv().await {
                    if tx.send((cluster_id.clone(), Ok(envelope))).await.is_err() {
                        return;
                    }
                }
            });
        }

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManualClock;
    use chrono::Utc;

    fn mock_client() -> Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            let body = serde_json::json!({ "status": { "allowed": true } });
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .status(201)
                    .header("content-type", "application/json")
                    .body(kube::client::Body::from(body.to_string().into_bytes()))
                    .unwrap(),
            )
        });
        Client::new(service, "default")
    }

    #[tokio::test]
    async fn missing_cluster_scope_is_rejected_without_touching_any_subsystem() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let aggregator = Aggregator::new(RefreshConfig::for_tests(), clock);
        let result = aggregator.snapshot("cluster-overview", "", None, BuildOptions::default()).await;
        assert!(matches!(result, Err(Error::MissingClusterScope)));
    }

    #[tokio::test]
    async fn fan_out_reports_cluster_not_active_per_cluster_without_failing_the_call() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let aggregator = Aggregator::new(RefreshConfig::for_tests(), clock);
        aggregator.add_cluster(ClusterId::new("prod:east"), mock_client(), false).await;

        let results = aggregator
            .snapshot("cluster-overview", "clusters=prod:east,prod:west|", None, BuildOptions::default())
            .await
            .unwrap();

        assert!(results.get(&ClusterId::new("prod:east")).unwrap().is_ok());
        assert!(matches!(
            results.get(&ClusterId::new("prod:west")).unwrap(),
            Err(Error::ClusterNotActive(_))
        ));
    }

    #[tokio::test]
    async fn removing_a_cluster_makes_it_not_active() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let aggregator = Aggregator::new(RefreshConfig::for_tests(), clock);
        let id = ClusterId::new("prod:east");
        aggregator.add_cluster(id.clone(), mock_client(), false).await;
        aggregator.remove_cluster(&id).await;

        let results = aggregator
            .snapshot("cluster-overview", "clusters=prod:east|", None, BuildOptions::default())
            .await
            .unwrap();
        assert!(matches!(results.get(&id).unwrap(), Err(Error::ClusterNotActive(_))));
    }
}
