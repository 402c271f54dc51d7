//! Client bundle and per-cluster informer set: domain builders read from
//! these informer caches rather than calling the API server directly.
//! Grounded on the reflector `store_shared` + `watcher` + `reflect_shared`
//! composition already used for the Deployment informer in this codebase's
//! controller module, generalized to every resource type the domain
//! builders need.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Event, Namespace, Node, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::Api;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scope::ClusterId;

const RELOAD_BUFFER_SIZE: usize = 256;

/// Everything a per-cluster subsystem is handed at construction time: the
/// typed client plus a stable identifier. Dynamic/metrics clients and the
/// REST config live in the caller's process and are opaque beyond this.
#[derive(Clone)]
pub struct ClientBundle {
    pub cluster_id: ClusterId,
    pub client: Client,
    /// Whether a `metrics.k8s.io` client is wired up; cluster-overview uses
    /// this to decide whether to report zero usage or omit the field.
    pub metrics_available: bool,
}

impl ClientBundle {
    pub fn new(cluster_id: ClusterId, client: Client, metrics_available: bool) -> Self {
        Self {
            cluster_id,
            client,
            metrics_available,
        }
    }
}

/// Reflector-backed read caches for every resource type a representative
/// builder consults. Each field is `None` when the subsystem never started
/// that informer (permission denied at registration, or the resource kind
/// is never needed by any registered domain).
#[derive(Clone, Default)]
pub struct InformerSet {
    pub namespaces: Option<Store<Namespace>>,
    pub nodes: Option<Store<Node>>,
    pub pods: Option<Store<Pod>>,
    pub deployments: Option<Store<Deployment>>,
    pub statefulsets: Option<Store<StatefulSet>>,
    pub daemonsets: Option<Store<DaemonSet>>,
    pub replicasets: Option<Store<ReplicaSet>>,
    pub jobs: Option<Store<Job>>,
    pub cronjobs: Option<Store<CronJob>>,
    pub configmaps: Option<Store<ConfigMap>>,
    pub secrets: Option<Store<Secret>>,
    pub services: Option<Store<Service>>,
    pub endpoints: Option<Store<Endpoints>>,
    pub endpointslices: Option<Store<EndpointSlice>>,
    pub ingresses: Option<Store<Ingress>>,
    pub networkpolicies: Option<Store<NetworkPolicy>>,
    pub roles: Option<Store<Role>>,
    pub rolebindings: Option<Store<RoleBinding>>,
    pub serviceaccounts: Option<Store<ServiceAccount>>,
    pub clusterroles: Option<Store<ClusterRole>>,
    pub clusterrolebindings: Option<Store<ClusterRoleBinding>>,
    pub events: Option<Store<Event>>,
}

/// Handles returned by `InformerSet::start_*` so the subsystem can abort
/// them all on shutdown.
pub struct InformerHandles {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl InformerHandles {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            handles: Vec::new(),
            cancel,
        }
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Cancels the shared token and aborts every watcher task. Called once,
    /// from `ClusterSubsystem::shutdown`.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for InformerHandles {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts a shared reflector store for resource kind `K`, returning the
/// read-side `Store` immediately and registering the background watcher
/// task with `handles`.
fn start_reflector<K>(client: Client, handles: &mut InformerHandles, cancel: CancellationToken) -> Store<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static,
    K: serde::de::DeserializeOwned,
{
    let (store, writer) = reflector::store_shared(RELOAD_BUFFER_SIZE);
    let api: Api<K> = Api::all(client);
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|_event| futures::future::ready(()));

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = stream => {}
            _ = cancel.cancelled() => {}
        }
    });
    handles.push(handle);
    store
}

impl InformerSet {
    /// Starts reflectors for exactly the resource kinds named in `kinds`
    /// (the registration pipeline decides this per the allow map so a
    /// denied resource never gets an informer).
    pub fn start(client: &Client, kinds: &[&str]) -> (Arc<Self>, InformerHandles) {
        let cancel = CancellationToken::new();
        let mut handles = InformerHandles::new(cancel.clone());
        let mut set = InformerSet::default();

        for kind in kinds {
            match *kind {
                "namespaces" => set.namespaces = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "nodes" => set.nodes = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "pods" => set.pods = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "deployments" => set.deployments = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "statefulsets" => set.statefulsets = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "daemonsets" => set.daemonsets = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "replicasets" => set.replicasets = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "jobs" => set.jobs = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "cronjobs" => set.cronjobs = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "configmaps" => set.configmaps = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "secrets" => set.secrets = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "services" => set.services = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "endpoints" => set.endpoints = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "endpointslices" => {
                    set.endpointslices = Some(start_reflector(client.clone(), &mut handles, cancel.clone()))
                }
                "ingresses" => set.ingresses = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "networkpolicies" => {
                    set.networkpolicies = Some(start_reflector(client.clone(), &mut handles, cancel.clone()))
                }
                "roles" => set.roles = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "rolebindings" => set.rolebindings = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "serviceaccounts" => {
                    set.serviceaccounts = Some(start_reflector(client.clone(), &mut handles, cancel.clone()))
                }
                "clusterroles" => set.clusterroles = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                "clusterrolebindings" => {
                    set.clusterrolebindings = Some(start_reflector(client.clone(), &mut handles, cancel.clone()))
                }
                "events" => set.events = Some(start_reflector(client.clone(), &mut handles, cancel.clone())),
                other => tracing::warn!(kind = other, "unknown informer kind requested, ignoring"),
            }
        }

        (Arc::new(set), handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_client() -> Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(
                http::Response::builder().status(200).body(kube::client::Body::empty()).unwrap(),
            )
        });
        Client::new(service, "default")
    }

    #[tokio::test]
    async fn start_only_wires_requested_kinds() {
        let (set, _handles) = InformerSet::start(&mock_client(), &["namespaces", "pods"]);
        assert!(set.namespaces.is_some());
        assert!(set.pods.is_some());
        assert!(set.nodes.is_none());
        assert!(set.events.is_none());
    }

    #[tokio::test]
    async fn start_with_no_kinds_wires_nothing() {
        let (set, _handles) = InformerSet::start(&mock_client(), &[]);
        assert!(set.namespaces.is_none());
        assert!(set.pods.is_none());
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored_rather_than_erroring() {
        let (set, _handles) = InformerSet::start(&mock_client(), &["not-a-real-kind"]);
        assert!(set.pods.is_none());
    }

    #[tokio::test]
    async fn stop_aborts_every_watcher_task() {
        let (_set, mut handles) = InformerSet::start(&mock_client(), &["pods", "nodes"]);
        handles.stop();
        assert!(handles.cancel.is_cancelled());
    }
}
