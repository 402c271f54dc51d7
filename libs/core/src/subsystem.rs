//! `ClusterSubsystem`: the per-cluster composition root. Wires together
//! the registration pipeline, the snapshot service, the stream registry,
//! the manual refresh queue and the telemetry recorder behind one typed
//! handle, and exposes the handful of operations a transport (or the
//! aggregator, for multi-cluster fan-out) actually needs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{AsyncBufReadExt, TryStreamExt};
use kube::api::{Api, LogParams};
use kube::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Clock, RefreshConfig};
use crate::domains;
use crate::error::{Error, Result};
use crate::informers::{ClientBundle, InformerHandles, InformerSet};
use crate::manual_queue::{ManualJob, ManualRefreshQueue};
use crate::metrics::Metrics;
use crate::permissions::{PermissionChecker, PermissionDescriptor};
use crate::registration::{self, DomainCandidate, PermissionIssue, Requirement};
use crate::registry::{DomainConfig, DomainRegistry};
use crate::scope::{ClusterId, DomainCategory, Scope};
use crate::snapshot::builder::DomainBuilder;
use crate::snapshot::{BuildContext, BuildOptions, Snapshot, SnapshotService};
use crate::stream::{EnvelopeKind, StreamRegistry, Subscription};
use crate::telemetry_recorder::{DomainTelemetry, TelemetryRecorder};

const OBJECT_LOGS_DOMAIN: &str = "object-logs";
const OBJECT_LOGS_TAIL_LINES: i64 = 200;

/// Every resource kind an `InformerSet` knows how to reflect. Used to
/// validate the dynamically computed informer kind list below; a resource
/// key with no corresponding reflector (e.g. `core/pods/log`, read directly
/// rather than cached) is simply not startable and is dropped.
fn known_informer_kinds() -> &'static [&'static str] {
    &[
        "namespaces",
        "nodes",
        "pods",
        "deployments",
        "statefulsets",
        "daemonsets",
        "replicasets",
        "jobs",
        "cronjobs",
        "configmaps",
        "secrets",
        "services",
        "endpoints",
        "endpointslices",
        "ingresses",
        "networkpolicies",
        "serviceaccounts",
        "roles",
        "rolebindings",
        "clusterroles",
        "clusterrolebindings",
        "events",
    ]
}

/// Turns the registration pipeline's active resource key set (e.g.
/// `"apps/deployments"`) into the informer kinds to start. Only resources
/// actually wired to a non-placeholder domain get a reflector started, so a
/// `permissionDenied` domain's declared resources never see a list/watch.
fn informer_kinds_for(active_resource_keys: &std::collections::HashSet<String>) -> Vec<&'static str> {
    let known = known_informer_kinds();
    let mut kinds: std::collections::HashSet<&'static str> = std::collections::HashSet::new();
    for key in active_resource_keys {
        let suffix = key.rsplit('/').next().unwrap_or(key);
        if let Some(kind) = known.iter().find(|k| **k == suffix) {
            kinds.insert(kind);
        }
    }
    kinds.into_iter().collect()
}

fn candidates() -> Vec<DomainCandidate> {
    vec![
        DomainCandidate {
            name: "cluster-overview".to_string(),
            category: DomainCategory::Cluster,
            requirement: domains::cluster_overview::ClusterOverviewBuilder::requirement(),
            builder: Arc::new(domains::cluster_overview::ClusterOverviewBuilder::new()),
        },
        DomainCandidate {
            name: "namespace-workloads".to_string(),
            category: DomainCategory::Namespace,
            requirement: domains::namespace_workloads::NamespaceWorkloadsBuilder::requirement(),
            builder: Arc::new(domains::namespace_workloads::NamespaceWorkloadsBuilder::new()),
        },
        DomainCandidate {
            name: "namespace-rbac".to_string(),
            category: DomainCategory::Namespace,
            requirement: domains::namespace_rbac::NamespaceRbacBuilder::requirement(),
            builder: Arc::new(domains::namespace_rbac::NamespaceRbacBuilder::new()),
        },
        DomainCandidate {
            name: "cluster-events".to_string(),
            category: DomainCategory::Cluster,
            requirement: domains::cluster_events::ClusterEventsBuilder::requirement(),
            builder: Arc::new(domains::cluster_events::ClusterEventsBuilder::new()),
        },
        DomainCandidate {
            name: "object-events".to_string(),
            category: DomainCategory::Object,
            requirement: domains::object_events::ObjectEventsBuilder::requirement(),
            builder: Arc::new(domains::object_events::ObjectEventsBuilder::new()),
        },
        DomainCandidate {
            name: OBJECT_LOGS_DOMAIN.to_string(),
            category: DomainCategory::Object,
            requirement: domains::object_logs::ObjectLogsBuilder::requirement(),
            builder: Arc::new(domains::object_logs::ObjectLogsBuilder::new()),
        },
    ]
}

pub struct ClusterSubsystem {
    cluster_id: ClusterId,
    registry: Arc<DomainRegistry>,
    checker: Arc<PermissionChecker>,
    informers: Arc<InformerSet>,
    informer_handles: Mutex<InformerHandles>,
    client_bundle: Arc<ClientBundle>,
    snapshot_service: Arc<SnapshotService>,
    streams: Arc<StreamRegistry>,
    manual_queue: Arc<ManualRefreshQueue>,
    telemetry: Arc<TelemetryRecorder>,
    permission_issues: Vec<PermissionIssue>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    tailing: Mutex<std::collections::HashSet<String>>,
    shutdown: CancellationToken,
}

impl ClusterSubsystem {
    /// Builds and registers everything for one cluster: starts the
    /// informers every candidate domain might need, runs the registration
    /// pipeline (probing permissions and wiring placeholders for denied
    /// domains), and assembles the snapshot/stream/manual-queue/telemetry
    /// stack around the result.
    pub async fn new(
        cluster_id: ClusterId,
        client: Client,
        metrics_available: bool,
        config: RefreshConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_metrics(cluster_id, client, metrics_available, config, clock, Arc::new(Metrics::default())).await
    }

    /// Same as [`Self::new`] but folds Prometheus recording into a
    /// caller-supplied, process-wide [`Metrics`] instance instead of a
    /// private one — used by [`crate::aggregator::Aggregator`] so every
    /// routed cluster reports onto the same `/metrics` registry.
    pub async fn with_metrics(
        cluster_id: ClusterId,
        client: Client,
        metrics_available: bool,
        config: RefreshConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let client_bundle = Arc::new(ClientBundle::new(cluster_id.clone(), client.clone(), metrics_available));

        let checker = Arc::new(PermissionChecker::with_metrics(
            client.clone(),
            config.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(DomainRegistry::new());

        let candidates = candidates();
        let requirements: HashMap<String, Arc<Requirement>> = candidates
            .iter()
            .map(|c| (c.name.clone(), Arc::new(c.requirement.clone())))
            .collect();

        // Registration runs before any informer starts: a resource behind a
        // `permissionDenied` domain must never be listed/watched, so we need
        // the allow/deny outcome in hand before deciding which reflectors to
        // start.
        let (permission_issues, active_resource_keys) =
            registration::register_all(&registry, &checker, candidates, config.registration_preflight_timeout).await;
        let informer_kinds = informer_kinds_for(&active_resource_keys);
        let (informers, informer_handles) = InformerSet::start(&client, &informer_kinds);

        let telemetry = Arc::new(TelemetryRecorder::new());
        let snapshot_service = Arc::new(SnapshotService::with_metrics(
            registry.clone(),
            checker.clone(),
            informers.clone(),
            client_bundle.clone(),
            requirements,
            config.clone(),
            clock.clone(),
            telemetry.clone(),
            metrics.clone(),
        ));

        let streams = Arc::new(StreamRegistry::new(&config));
        let manual_queue = ManualRefreshQueue::with_metrics(
            snapshot_service.clone(),
            streams.clone(),
            config.manual_queue_workers,
            metrics.clone(),
        );

        Self {
            cluster_id,
            registry,
            checker,
            informers,
            informer_handles: Mutex::new(informer_handles),
            client_bundle,
            snapshot_service,
            streams,
            manual_queue,
            telemetry,
            permission_issues,
            config,
            metrics,
            clock,
            tailing: Mutex::new(std::collections::HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// `Snapshot(domain, scope, options) -> Snapshot | Error`.
    pub async fn snapshot(&self, domain: &str, scope: Scope, options: BuildOptions) -> Result<Snapshot> {
        self.snapshot_service.build(domain, scope, options).await
    }

    /// `PermissionIssues()`: recorded once at registration; a domain denied
    /// later (a token whose RBAC changed mid-session) surfaces instead as a
    /// `PermissionDenied` error from `snapshot`/`stream`, not here.
    pub fn permission_issues(&self) -> &[PermissionIssue] {
        &self.permission_issues
    }

    pub async fn telemetry_summary(&self) -> HashMap<String, DomainTelemetry> {
        self.telemetry.summary().await
    }

    pub async fn submit_manual_refresh(&self, domain: &str, scope: Scope) -> String {
        self.manual_queue.submit(domain, scope).await
    }

    pub async fn manual_job(&self, job_id: &str) -> Option<ManualJob> {
        self.manual_queue.get(job_id).await
    }

    pub async fn cancel_manual_refresh(&self, job_id: &str) {
        self.manual_queue.cancel(job_id).await
    }

    /// Connects to the `(domain, scope)` event stream. Registers the
    /// subscriber before computing replay, per the hub's own correctness
    /// contract. On a hub's very first connection this also seeds it: for
    /// `object-logs`, an empty `reset` followed by the current log batch
    /// (the two-envelope connect handshake), then starts a background
    /// tailer; for every other domain, a `reset` carrying the current
    /// snapshot. A caller drains `subscription.replay` first, then
    /// `subscription.recv()`.
    pub async fn stream(&self, domain: &str, scope: Scope, last_seen_sequence: Option<u64>) -> Result<Subscription> {
        let config = self
            .registry
            .get(domain)
            .await
            .ok_or_else(|| Error::UnknownDomain(domain.to_string()))?;
        if config.permission_denied {
            return Err(Error::PermissionDenied(domain.to_string()));
        }

        let hub = self.streams.get_or_create(domain, &scope.to_string()).await;
        let subscription = hub.subscribe(last_seen_sequence).await?;
        self.telemetry.record_connect(domain, &scope.to_string()).await;
        self.metrics.streams.set_subscribers(domain, hub.subscriber_count().await as i64);

        if subscription.replay.is_empty() && last_seen_sequence.is_none() {
            if domain == OBJECT_LOGS_DOMAIN {
                hub.publish(EnvelopeKind::Reset, json!({ "lines": [] })).await;
                let ctx = self.build_context_for(domain, scope.clone()).await?;
                let batch = domains::object_logs::fetch_batch(&ctx, OBJECT_LOGS_TAIL_LINES).await?;
                hub.publish(EnvelopeKind::Delta, batch).await;
                self.ensure_log_tailer(domain, scope).await;
            } else if let Ok(snapshot) = self.snapshot(domain, scope.clone(), BuildOptions::default()).await {
                hub.publish(EnvelopeKind::Reset, snapshot.payload).await;
            }
        }

        Ok(subscription)
    }

    async fn build_context_for(&self, domain: &str, scope: Scope) -> Result<BuildContext> {
        let requirement = candidates().into_iter().find(|c| c.name == domain).map(|c| c.requirement);
        let allow_map = match requirement {
            Some(requirement) => registration::ensure_permissions(&self.checker, &requirement, &scope).await?,
            None => HashMap::new(),
        };

        Ok(BuildContext {
            scope,
            timeout: self.config.build_timeout,
            permissions: Arc::new(allow_map),
            informers: self.informers.clone(),
            client_bundle: self.client_bundle.clone(),
            cancellation: self.shutdown.clone(),
        })
    }

    /// Spawns a follow-mode log tailer for `(domain, scope)` if one is not
    /// already running, publishing every new line as a `Delta` envelope.
    /// Guarded so a second connect to an already-tailed scope never starts
    /// a duplicate tailer.
    async fn ensure_log_tailer(&self, domain: &str, scope: Scope) {
        let key = format!("{domain}\u{1}{scope}");
        {
            let mut tailing = self.tailing.lock().await;
            if tailing.contains(&key) {
                return;
            }
            tailing.insert(key.clone());
        }

        let (namespace, pod_name) = match &scope {
            Scope::Object { kind, namespace, name } if kind == "Pod" => (namespace.clone(), name.clone()),
            _ => return,
        };

        let client = self.client_bundle.client.clone();
        let hub = self.streams.get_or_create(domain, &scope.to_string()).await;
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            let api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client, &namespace);
            let params = LogParams { follow: true, timestamps: true, ..Default::default() };
            let stream = match api.log_stream(&pod_name, &params).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, pod = %pod_name, "failed to start log tailer");
                    hub.publish(EnvelopeKind::Error, json!(error.to_string())).await;
                    return;
                }
            };

            let mut reader = stream.lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = reader.try_next() => match line {
                        Ok(Some(line)) => {
                            hub.publish(EnvelopeKind::Delta, json!({ "lines": [line] })).await;
                        }
                        Ok(None) => break,
                        Err(error) => {
                            warn!(%error, pod = %pod_name, "log tailer stream error");
                            hub.publish(EnvelopeKind::Error, json!(error.to_string())).await;
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Attaches an ephemeral debug container to the pod named by `scope`
    /// and waits for it to reach `Running`. A runtime SSAR check guards
    /// this the same way a registered domain's requirement would, since
    /// ephemeral-debug is a one-shot action rather than a cacheable
    /// snapshot and is never itself registered in the domain registry.
    pub async fn create_debug_container(&self, scope: Scope, image: &str) -> Result<serde_json::Value> {
        let descriptor = PermissionDescriptor::new("create", "", "pods").with_subresource("ephemeralcontainers");
        let descriptor = match &scope {
            Scope::Object { namespace, .. } => descriptor.with_namespace(namespace.clone()),
            _ => descriptor,
        };
        let decision = self.checker.check(&descriptor).await;
        if !decision.allowed {
            return Err(Error::PermissionDenied("core/pods/ephemeralcontainers".to_string()));
        }

        let ctx = BuildContext {
            scope,
            timeout: self.config.ephemeral_debug_timeout,
            permissions: Arc::new(HashMap::new()),
            informers: self.informers.clone(),
            client_bundle: self.client_bundle.clone(),
            cancellation: self.shutdown.clone(),
        };

        domains::ephemeral_debug::create_debug_container(
            &ctx,
            image,
            self.config.ephemeral_debug_poll_interval,
            self.config.ephemeral_debug_timeout,
        )
        .await
    }

    /// Aborts every informer watcher, closes every stream hub (with a
    /// terminal error envelope so subscribers know this is a deliberate
    /// shutdown, not a drop), and cancels any in-flight log tailer.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.informer_handles.lock().await.stop();
        self.streams.close_all("subsystem shutting down").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManualClock;

    fn mock_client() -> Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            let body = json!({ "status": { "allowed": true } });
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
    async fn registers_every_candidate_domain() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let subsystem = ClusterSubsystem::new(
            ClusterId::new("test:ctx"),
            mock_client(),
            false,
            RefreshConfig::for_tests(),
            clock,
        )
        .await;

        for name in ["cluster-overview", "namespace-workloads", "namespace-rbac", "cluster-events", "object-events", "object-logs"] {
            assert!(subsystem.registry.get(name).await.is_some(), "{name} should be registered");
        }
    }

    #[tokio::test]
    async fn unknown_domain_snapshot_is_an_error() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let subsystem = ClusterSubsystem::new(
            ClusterId::new("test:ctx"),
            mock_client(),
            false,
            RefreshConfig::for_tests(),
            clock,
        )
        .await;

        let result = subsystem.snapshot("missing", Scope::Empty, BuildOptions::default()).await;
        assert!(matches!(result, Err(Error::UnknownDomain(_))));
    }

    fn deny_all_client() -> Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            let body = json!({ "status": { "allowed": false, "reason": "denied by RBAC" } });
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

    /// Every domain whose requirement is entirely denied becomes a
    /// placeholder, and — since nothing it declared ever became an active
    /// resource key — no informer starts for any of its resources.
    #[tokio::test]
    async fn fully_denied_identity_registers_only_placeholders_and_starts_no_informers() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let subsystem = ClusterSubsystem::new(
            ClusterId::new("test:ctx"),
            deny_all_client(),
            false,
            RefreshConfig::for_tests(),
            clock,
        )
        .await;

        for name in ["cluster-overview", "namespace-workloads", "namespace-rbac", "cluster-events", "object-events", "object-logs"] {
            let config = subsystem.registry.get(name).await.unwrap();
            assert!(config.permission_denied, "{name} should be a placeholder when every resource is denied");
        }
        assert!(!subsystem.permission_issues().is_empty());

        assert!(subsystem.informers.namespaces.is_none());
        assert!(subsystem.informers.pods.is_none());
        assert!(subsystem.informers.events.is_none());

        let result = subsystem.snapshot("cluster-overview", Scope::Empty, BuildOptions::default()).await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn informer_kinds_for_maps_resource_keys_to_known_kinds_only() {
        let mut keys = std::collections::HashSet::new();
        keys.insert("apps/deployments".to_string());
        keys.insert("rbac.authorization.k8s.io/roles".to_string());
        keys.insert("core/pods/log".to_string()); // no informer for this one
        let kinds = informer_kinds_for(&keys);
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&"deployments"));
        assert!(kinds.contains(&"roles"));
    }
}
