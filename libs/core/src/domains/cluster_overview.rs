//! cluster-overview: node/namespace counts, per-node capacity/allocatable,
//! best-effort metrics usage, and a cluster-wide pod readiness rollup.
//! Metrics are optional: a cluster with no `metrics.k8s.io` client wired
//! reports zero usage rather than failing the build.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::ResourceExt;
use serde_json::json;

use crate::domains::quantity::{format_cpu_millis, format_mem_bytes, parse_cpu_millis, parse_mem_bytes};
use crate::error::{Error, Result};
use crate::permissions::PermissionDescriptor;
use crate::registration::{Requirement, ResourceRequirement};
use crate::snapshot::builder::{BuildContext, DomainBuilder};
use crate::snapshot::types::{BuiltPayload, SnapshotStats};

pub struct ClusterOverviewBuilder;

impl ClusterOverviewBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn requirement() -> Requirement {
        Requirement::RequireAll(vec![
            ResourceRequirement::new("core/nodes", PermissionDescriptor::new("list", "", "nodes")),
            ResourceRequirement::new("core/namespaces", PermissionDescriptor::new("list", "", "namespaces")),
            ResourceRequirement::new("core/pods", PermissionDescriptor::new("list", "", "pods")),
        ])
    }
}

impl Default for ClusterOverviewBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort `metrics.k8s.io` NodeMetrics lookup, keyed by node name. Any
/// failure (no metrics-server installed, RBAC denial, discovery miss) just
/// yields an empty map; this is never a build failure.
async fn node_usage(ctx: &BuildContext) -> HashMap<String, (i64, i64)> {
    if !ctx.client_bundle.metrics_available {
        return HashMap::new();
    }

    let gvk = GroupVersionKind {
        group: "metrics.k8s.io".to_string(),
        version: "v1beta1".to_string(),
        kind: "NodeMetrics".to_string(),
    };
    let resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::all_with(ctx.client_bundle.client.clone(), &resource);

    match api.list(&ListParams::default()).await {
        Ok(list) => list
            .items
            .into_iter()
            .map(|item| {
                let name = item.name_any();
                let usage = item.data.get("usage");
                let cpu = usage
                    .and_then(|u| u.get("cpu"))
                    .and_then(|v| v.as_str())
                    .map(|s| parse_cpu_millis(&k8s_openapi::apimachinery::pkg::api::resource::Quantity(s.to_string())))
                    .unwrap_or(0);
                let mem = usage
                    .and_then(|u| u.get("memory"))
                    .and_then(|v| v.as_str())
                    .map(|s| parse_mem_bytes(&k8s_openapi::apimachinery::pkg::api::resource::Quantity(s.to_string())))
                    .unwrap_or(0);
                (name, (cpu, mem))
            })
            .collect(),
        Err(error) => {
            tracing::debug!(%error, "metrics.k8s.io unavailable; reporting zero node usage");
            HashMap::new()
        }
    }
}

#[async_trait]
impl DomainBuilder for ClusterOverviewBuilder {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload> {
        let nodes_store = ctx
            .informers
            .nodes
            .as_ref()
            .ok_or_else(|| Error::Internal("nodes informer not started".to_string()))?;
        let namespaces_store = ctx
            .informers
            .namespaces
            .as_ref()
            .ok_or_else(|| Error::Internal("namespaces informer not started".to_string()))?;
        let pods_store = ctx
            .informers
            .pods
            .as_ref()
            .ok_or_else(|| Error::Internal("pods informer not started".to_string()))?;

        let usage = node_usage(ctx).await;
        let mut nodes = nodes_store.state();
        nodes.sort_by(|a, b| a.name_any().cmp(&b.name_any()));

        let node_entries: Vec<_> = nodes
            .iter()
            .map(|node| {
                let status = node.status.as_ref();
                let capacity = status.and_then(|s| s.capacity.as_ref());
                let allocatable = status.and_then(|s| s.allocatable.as_ref());
                let cpu_capacity = capacity.and_then(|m| m.get("cpu")).map(parse_cpu_millis).unwrap_or(0);
                let mem_capacity = capacity.and_then(|m| m.get("memory")).map(parse_mem_bytes).unwrap_or(0);
                let cpu_allocatable = allocatable.and_then(|m| m.get("cpu")).map(parse_cpu_millis).unwrap_or(0);
                let mem_allocatable = allocatable.and_then(|m| m.get("memory")).map(parse_mem_bytes).unwrap_or(0);
                let (cpu_usage, mem_usage) = usage.get(&node.name_any()).copied().unwrap_or((0, 0));

                json!({
                    "name": node.name_any(),
                    "cpuCapacity": format_cpu_millis(cpu_capacity),
                    "memCapacity": format_mem_bytes(mem_capacity),
                    "cpuAllocatable": format_cpu_millis(cpu_allocatable),
                    "memAllocatable": format_mem_bytes(mem_allocatable),
                    "cpuUsage": format_cpu_millis(cpu_usage),
                    "memUsage": format_mem_bytes(mem_usage),
                })
            })
            .collect();

        let pods = pods_store.state();
        let (ready, total) = pods.iter().fold((0usize, 0usize), |(ready, total), pod| {
            let is_ready = pod
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
                .unwrap_or(false);
            (ready + usize::from(is_ready), total + 1)
        });

        let payload = json!({
            "nodeCount": nodes.len(),
            "namespaceCount": namespaces_store.state().len(),
            "nodes": node_entries,
            "podReadiness": { "ready": ready, "total": total },
        });

        let mut stats = SnapshotStats { item_count: nodes.len(), ..Default::default() };
        stats.source_flags.insert("metrics".to_string(), ctx.client_bundle.metrics_available);

        Ok(BuiltPayload::new(payload, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informers::{ClientBundle, InformerSet};
    use crate::scope::ClusterId;
    use k8s_openapi::api::core::v1::{Namespace, Node, NodeStatus, Pod, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn mock_client() -> kube::Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(http::Response::builder().status(200).body(kube::client::Body::empty()).unwrap())
        });
        kube::Client::new(service, "default")
    }

    fn node(name: &str, cpu_capacity: &str, mem_capacity: &str) -> Node {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity(cpu_capacity.to_string()));
        capacity.insert("memory".to_string(), Quantity(mem_capacity.to_string()));
        Node {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            status: Some(NodeStatus {
                capacity: Some(capacity.clone()),
                allocatable: Some(capacity),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ctx_with(nodes: Vec<Node>, namespaces: Vec<Namespace>, pods: Vec<Pod>, metrics_available: bool) -> BuildContext {
        let (node_store, mut node_writer) = reflector::store::<Node>();
        for n in nodes {
            node_writer.apply_watcher_event(&kube::runtime::watcher::Event::Apply(n));
        }
        let (ns_store, mut ns_writer) = reflector::store::<Namespace>();
        for ns in namespaces {
            ns_writer.apply_watcher_event(&kube::runtime::watcher::Event::Apply(ns));
        }
        let (pod_store, mut pod_writer) = reflector::store::<Pod>();
        for (i, p) in pods.into_iter().enumerate() {
            let mut p = p;
            p.metadata.name = Some(format!("pod-{i}"));
            pod_writer.apply_watcher_event(&kube::runtime::watcher::Event::Apply(p));
        }

        let mut informers = InformerSet::default();
        informers.nodes = Some(node_store);
        informers.namespaces = Some(ns_store);
        informers.pods = Some(pod_store);

        BuildContext {
            scope: crate::scope::Scope::Empty,
            timeout: std::time::Duration::from_secs(1),
            permissions: Arc::new(std::collections::HashMap::new()),
            informers: Arc::new(informers),
            client_bundle: Arc::new(ClientBundle::new(ClusterId::new("test:ctx"), mock_client(), metrics_available)),
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn node_capacity_is_parsed_from_quantities() {
        let ctx = ctx_with(vec![node("node-a", "4", "8Gi")], vec![], vec![], false);
        let built = ClusterOverviewBuilder::new().build(&ctx).await.unwrap();
        let nodes = built.payload.get("nodes").unwrap().as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["cpuCapacity"], "4000m");
        assert_eq!(nodes[0]["memUsage"], "0");
    }

    #[tokio::test]
    async fn metrics_unavailable_reports_zero_usage_and_flags_it() {
        let ctx = ctx_with(vec![node("node-a", "2", "4Gi")], vec![], vec![], false);
        let built = ClusterOverviewBuilder::new().build(&ctx).await.unwrap();
        assert_eq!(built.stats.source_flags.get("metrics"), Some(&false));
    }

    #[tokio::test]
    async fn pod_readiness_is_rolled_up_across_all_pods() {
        let ctx = ctx_with(vec![], vec![], vec![pod(true), pod(true), pod(false)], false);
        let built = ClusterOverviewBuilder::new().build(&ctx).await.unwrap();
        assert_eq!(built.payload["podReadiness"]["ready"], 2);
        assert_eq!(built.payload["podReadiness"]["total"], 3);
    }

    #[tokio::test]
    async fn missing_nodes_informer_is_an_internal_error() {
        let informers = InformerSet::default();
        let ctx = BuildContext {
            scope: crate::scope::Scope::Empty,
            timeout: std::time::Duration::from_secs(1),
            permissions: Arc::new(std::collections::HashMap::new()),
            informers: Arc::new(informers),
            client_bundle: Arc::new(ClientBundle::new(ClusterId::new("test:ctx"), mock_client(), false)),
            cancellation: tokio_util::sync::CancellationToken::new(),
        };
        let result = ClusterOverviewBuilder::new().build(&ctx).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
