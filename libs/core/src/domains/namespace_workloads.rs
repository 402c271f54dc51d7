//! namespace-workloads: pods, deployments, statefulsets, daemonsets, jobs
//! and cronjobs for one namespace, with kubectl-parity pod status,
//! resource aggregation, and ReplicaSet→Deployment owner collapse.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::json;

use crate::domains::pod_status::{ready_display, status_string};
use crate::domains::quantity::{aggregate_pod_resources, format_cpu_millis, format_mem_bytes};
use crate::error::{Error, Result};
use crate::permissions::PermissionDescriptor;
use crate::registration::{Requirement, ResourceRequirement};
use crate::scope::Scope;
use crate::snapshot::builder::{BuildContext, DomainBuilder};
use crate::snapshot::types::{BuiltPayload, SnapshotStats};

pub struct NamespaceWorkloadsBuilder;

impl NamespaceWorkloadsBuilder {
    pub fn new() -> Self {
        Self
    }

    /// `requireAny`: a namespace with, say, only `list pods` allowed still
    /// gets a namespace-workloads snapshot — just one with every other
    /// resource type omitted. Each resource is gated independently in
    /// `build` via `ctx.resource_allowed`, including `core/pods` and
    /// `apps/replicasets` (needed for owner-collapse), so a denial of any
    /// one of them degrades rather than failing the whole domain.
    pub fn requirement() -> Requirement {
        Requirement::RequireAny(vec![
            ResourceRequirement::new("core/pods", PermissionDescriptor::new("list", "", "pods")),
            ResourceRequirement::new("apps/deployments", PermissionDescriptor::new("list", "apps", "deployments")),
            ResourceRequirement::new("apps/statefulsets", PermissionDescriptor::new("list", "apps", "statefulsets")),
            ResourceRequirement::new("apps/daemonsets", PermissionDescriptor::new("list", "apps", "daemonsets")),
            ResourceRequirement::new("apps/replicasets", PermissionDescriptor::new("list", "apps", "replicasets")),
            ResourceRequirement::new("batch/jobs", PermissionDescriptor::new("list", "batch", "jobs")),
            ResourceRequirement::new("batch/cronjobs", PermissionDescriptor::new("list", "batch", "cronjobs")),
        ])
    }
}

impl Default for NamespaceWorkloadsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn controller_owner(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners.iter().find(|o| o.controller.unwrap_or(false))
}

#[async_trait]
impl DomainBuilder for NamespaceWorkloadsBuilder {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload> {
        let namespace = match &ctx.scope {
            Scope::Namespace(ns) => ns.clone(),
            other => {
                return Err(Error::InvariantViolation(format!(
                    "namespace-workloads requires a namespace scope, got {other}"
                )))
            }
        };

        // Built once per build call, not once per pod: the owner-collapse
        // rule only ever needs the ReplicaSets in this namespace. Omitted
        // entirely when `apps/replicasets` is denied — owner collapse then
        // falls back to reporting the ReplicaSet itself as the owner.
        let mut rs_to_deployment: HashMap<String, String> = HashMap::new();
        if ctx.resource_allowed("apps/replicasets") {
            if let Some(replicasets_store) = ctx.informers.replicasets.as_ref() {
                for rs in replicasets_store.state().iter().filter(|rs| rs.namespace().as_deref() == Some(namespace.as_str())) {
                    if let Some(owner) = controller_owner(rs.owner_references()) {
                        if owner.kind == "Deployment" {
                            rs_to_deployment.insert(rs.name_any(), owner.name.clone());
                        }
                    }
                }
            }
        }

        let mut source_flags = HashMap::new();

        let mut pods = if ctx.resource_allowed("core/pods") {
            source_flags.insert("pods".to_string(), true);
            ctx.informers.pods.as_ref().map(|store| store.state()).unwrap_or_default()
        } else {
            Vec::new()
        };
        pods.retain(|p| p.namespace().as_deref() == Some(namespace.as_str()));
        pods.sort_by(|a, b| a.name_any().cmp(&b.name_any()));

        let pod_entries: Vec<_> = pods
            .iter()
            .map(|pod| {
                let status = status_string(pod);
                let ready = ready_display(pod);
                let totals = pod.spec.as_ref().map(aggregate_pod_resources).unwrap_or_default();

                let (owner_kind, owner_name) = match controller_owner(pod.owner_references()) {
                    Some(owner) if owner.kind == "ReplicaSet" => match rs_to_deployment.get(&owner.name) {
                        Some(deployment) => ("Deployment".to_string(), deployment.clone()),
                        None => ("ReplicaSet".to_string(), owner.name.clone()),
                    },
                    Some(owner) => (owner.kind.clone(), owner.name.clone()),
                    None => (String::new(), String::new()),
                };

                json!({
                    "name": pod.name_any(),
                    "status": status,
                    "ready": ready,
                    "ownerKind": owner_kind,
                    "ownerName": owner_name,
                    "cpuRequest": format_cpu_millis(totals.cpu_request_millis),
                    "cpuLimit": format_cpu_millis(totals.cpu_limit_millis),
                    "memRequest": format_mem_bytes(totals.mem_request_bytes),
                    "memLimit": format_mem_bytes(totals.mem_limit_bytes),
                })
            })
            .collect();

        let deployments: Vec<_> = if ctx.resource_allowed("apps/deployments") {
            source_flags.insert("deployments".to_string(), true);
            ctx.informers
                .deployments
                .as_ref()
                .map(|store| store.state())
                .unwrap_or_default()
                .iter()
                .filter(|d| d.namespace().as_deref() == Some(namespace.as_str()))
                .map(|d| {
                    json!({
                        "name": d.name_any(),
                        "replicas": d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
                        "readyReplicas": d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let statefulsets: Vec<_> = if ctx.resource_allowed("apps/statefulsets") {
            source_flags.insert("statefulSets".to_string(), true);
            ctx.informers
                .statefulsets
                .as_ref()
                .map(|store| store.state())
                .unwrap_or_default()
                .iter()
                .filter(|s| s.namespace().as_deref() == Some(namespace.as_str()))
                .map(|s| {
                    json!({
                        "name": s.name_any(),
                        "replicas": s.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0),
                        "readyReplicas": s.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let daemonsets: Vec<_> = if ctx.resource_allowed("apps/daemonsets") {
            source_flags.insert("daemonSets".to_string(), true);
            ctx.informers
                .daemonsets
                .as_ref()
                .map(|store| store.state())
                .unwrap_or_default()
                .iter()
                .filter(|d| d.namespace().as_deref() == Some(namespace.as_str()))
                .map(|d| {
                    json!({
                        "name": d.name_any(),
                        "desiredNumberScheduled": d.status.as_ref().map(|s| s.desired_number_scheduled).unwrap_or(0),
                        "numberReady": d.status.as_ref().map(|s| s.number_ready).unwrap_or(0),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let jobs: Vec<_> = if ctx.resource_allowed("batch/jobs") {
            source_flags.insert("jobs".to_string(), true);
            ctx.informers
                .jobs
                .as_ref()
                .map(|store| store.state())
                .unwrap_or_default()
                .iter()
                .filter(|j| j.namespace().as_deref() == Some(namespace.as_str()))
                .map(|j| {
                    json!({
                        "name": j.name_any(),
                        "active": j.status.as_ref().and_then(|s| s.active).unwrap_or(0),
                        "succeeded": j.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0),
                        "failed": j.status.as_ref().and_then(|s| s.failed).unwrap_or(0),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let cronjobs: Vec<_> = if ctx.resource_allowed("batch/cronjobs") {
            source_flags.insert("cronJobs".to_string(), true);
            ctx.informers
                .cronjobs
                .as_ref()
                .map(|store| store.state())
                .unwrap_or_default()
                .iter()
                .filter(|c| c.namespace().as_deref() == Some(namespace.as_str()))
                .map(|c| {
                    json!({
                        "name": c.name_any(),
                        "schedule": c.spec.as_ref().map(|s| s.schedule.clone()).unwrap_or_default(),
                        "suspended": c.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let item_count = pod_entries.len() + deployments.len() + statefulsets.len() + daemonsets.len() + jobs.len() + cronjobs.len();

        let payload = json!({
            "pods": pod_entries,
            "deployments": deployments,
            "statefulSets": statefulsets,
            "daemonSets": daemonsets,
            "jobs": jobs,
            "cronJobs": cronjobs,
        });

        Ok(BuiltPayload::new(payload, SnapshotStats { item_count, source_flags, ..Default::default() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informers::{ClientBundle, InformerSet};
    use crate::scope::ClusterId;
    use std::sync::Arc;

    fn mock_client() -> kube::Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(http::Response::builder().status(200).body(kube::client::Body::empty()).unwrap())
        });
        kube::Client::new(service, "default")
    }

    fn ctx_with_permissions(permissions: HashMap<String, bool>) -> BuildContext {
        let client = mock_client();
        BuildContext {
            scope: Scope::Namespace("team-a".to_string()),
            timeout: std::time::Duration::from_secs(1),
            permissions: Arc::new(permissions),
            informers: Arc::new(InformerSet::default()),
            client_bundle: Arc::new(ClientBundle::new(ClusterId::new("test:ctx"), client, false)),
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn only_allowed_resources_appear_in_the_payload_and_source_flags() {
        let mut permissions = HashMap::new();
        permissions.insert("core/pods".to_string(), true);
        permissions.insert("apps/deployments".to_string(), false);
        permissions.insert("apps/statefulsets".to_string(), false);
        permissions.insert("apps/daemonsets".to_string(), false);
        permissions.insert("apps/replicasets".to_string(), false);
        permissions.insert("batch/jobs".to_string(), false);
        permissions.insert("batch/cronjobs".to_string(), false);
        let ctx = ctx_with_permissions(permissions);

        let built = NamespaceWorkloadsBuilder::new().build(&ctx).await.unwrap();
        assert_eq!(built.payload.get("pods").and_then(|v| v.as_array()).map(|a| a.len()), Some(0));
        assert_eq!(built.payload.get("deployments").and_then(|v| v.as_array()).map(|a| a.len()), Some(0));
        assert_eq!(built.payload.get("jobs").and_then(|v| v.as_array()).map(|a| a.len()), Some(0));

        assert_eq!(built.stats.source_flags.get("pods"), Some(&true));
        assert!(!built.stats.source_flags.contains_key("deployments"));
        assert!(!built.stats.source_flags.contains_key("statefulSets"));
        assert!(!built.stats.source_flags.contains_key("daemonSets"));
        assert!(!built.stats.source_flags.contains_key("jobs"));
        assert!(!built.stats.source_flags.contains_key("cronJobs"));
    }

    #[tokio::test]
    async fn fully_denied_namespace_still_builds_an_empty_payload_not_an_error() {
        let ctx = ctx_with_permissions(HashMap::new());

        let built = NamespaceWorkloadsBuilder::new().build(&ctx).await.unwrap();
        assert!(built.stats.source_flags.is_empty());
        assert_eq!(built.stats.item_count, 0);
        for key in ["pods", "deployments", "statefulSets", "daemonSets", "jobs", "cronJobs"] {
            assert_eq!(built.payload.get(key).and_then(|v| v.as_array()).map(|a| a.len()), Some(0));
        }
    }

    #[tokio::test]
    async fn non_namespace_scope_is_rejected() {
        let ctx = BuildContext {
            scope: Scope::Empty,
            ..ctx_with_permissions(HashMap::new())
        };
        let result = NamespaceWorkloadsBuilder::new().build(&ctx).await;
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
    }
}
