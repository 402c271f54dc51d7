//! Permission-aware registration pipeline and runtime gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::permissions::{PermissionChecker, PermissionDescriptor};
use crate::registry::{DomainConfig, DomainRegistry};
use crate::scope::Scope;
use crate::snapshot::builder::DomainBuilder;
use crate::snapshot::types::PermissionMap;

/// One resource a domain depends on: the allow-map key it is reported under
/// (e.g. `"apps/deployments"`) and the descriptor template used to probe it.
/// `descriptor.namespace` is left `None` here; the runtime gate fills it in
/// from the request scope for namespace/object-scoped domains.
#[derive(Clone)]
pub struct ResourceRequirement {
    pub key: String,
    pub descriptor: PermissionDescriptor,
}

impl ResourceRequirement {
    pub fn new(key: impl Into<String>, descriptor: PermissionDescriptor) -> Self {
        Self {
            key: key.into(),
            descriptor,
        }
    }
}

/// A domain's declared permission requirement.
#[derive(Clone)]
pub enum Requirement {
    RequireAll(Vec<ResourceRequirement>),
    RequireAny(Vec<ResourceRequirement>),
}

impl Requirement {
    fn resources(&self) -> &[ResourceRequirement] {
        match self {
            Requirement::RequireAll(r) | Requirement::RequireAny(r) => r,
        }
    }
}

/// Recorded once per denied resource at registration time, and again any
/// time the runtime gate observes a newly-revoked permission.
#[derive(Debug, Clone)]
pub struct PermissionIssue {
    pub domain: String,
    pub resource: String,
    pub reason: String,
}

/// A domain candidate the registration pipeline evaluates at startup: a
/// name, category, requirement, the real builder, and the placeholder
/// builder substituted in when `requireAll` fails.
pub struct DomainCandidate {
    pub name: String,
    pub category: crate::scope::DomainCategory,
    pub requirement: Requirement,
    pub builder: Arc<dyn DomainBuilder>,
}

fn scope_namespace(scope: &Scope) -> Option<String> {
    match scope {
        Scope::Namespace(ns) => Some(ns.clone()),
        Scope::Object { namespace, .. } => Some(namespace.clone()),
        _ => None,
    }
}

fn descriptor_for_scope(template: &PermissionDescriptor, scope: &Scope) -> PermissionDescriptor {
    match scope_namespace(scope) {
        Some(ns) => template.clone().with_namespace(ns),
        None => template.clone(),
    }
}

/// Runs the startup registration pipeline: probes every candidate's
/// requirement in parallel, registers either the real or a placeholder
/// builder, and records `PermissionIssue`s. The second element of the
/// return tuple is the set of resource keys (e.g. `"apps/deployments"`)
/// that ended up wired to a non-placeholder domain — the only resources
/// any informer may be started for, so a `permissionDenied` domain's
/// declared resources never get a list/watch going.
pub async fn register_all(
    registry: &DomainRegistry,
    checker: &Arc<PermissionChecker>,
    candidates: Vec<DomainCandidate>,
    preflight_timeout: Duration,
) -> (Vec<PermissionIssue>, std::collections::HashSet<String>) {
    let all_descriptors: Vec<PermissionDescriptor> = candidates
        .iter()
        .flat_map(|c| c.requirement.resources().iter().map(|r| r.descriptor.clone()))
        .collect();
    checker.prime_with_timeout(&all_descriptors, preflight_timeout).await;

    let mut issues = Vec::new();
    let mut active_resource_keys: std::collections::HashSet<String> = std::collections::HashSet::new();
    for candidate in candidates {
        let decisions = checker.check_many(
            &candidate
                .requirement
                .resources()
                .iter()
                .map(|r| r.descriptor.clone())
                .collect::<Vec<_>>(),
        ).await;

        let mut allow_map: PermissionMap = HashMap::new();
        for r in candidate.requirement.resources() {
            let allowed = decisions
                .get(&r.descriptor.canonicalize().cache_key())
                .map(|d| d.allowed)
                .unwrap_or(false);
            allow_map.insert(r.key.clone(), allowed);
            if !allowed {
                let reason = decisions
                    .get(&r.descriptor.canonicalize().cache_key())
                    .and_then(|d| d.denied_reason.clone())
                    .unwrap_or_else(|| "denied by RBAC".to_string());
                issues.push(PermissionIssue {
                    domain: candidate.name.clone(),
                    resource: r.key.clone(),
                    reason,
                });
            }
        }

        let config = match &candidate.requirement {
            Requirement::RequireAll(_) => {
                let all_allowed = allow_map.values().all(|v| *v);
                if all_allowed {
                    info!(domain = %candidate.name, "registered (requireAll satisfied)");
                    for r in candidate.requirement.resources() {
                        active_resource_keys.insert(r.key.clone());
                    }
                    DomainConfig::new(candidate.name.clone(), candidate.category, candidate.builder.clone())
                } else {
                    info!(domain = %candidate.name, "registering placeholder (requireAll unsatisfied)");
                    DomainConfig::new(candidate.name.clone(), candidate.category, candidate.builder.clone())
                        .permission_denied(Arc::new(crate::snapshot::builder::PlaceholderBuilder::new(
                            candidate.name.clone(),
                        )))
                }
            }
            Requirement::RequireAny(_) => {
                let any_allowed = allow_map.values().any(|v| *v);
                if any_allowed {
                    info!(domain = %candidate.name, "registered (requireAny satisfied)");
                    for r in candidate.requirement.resources() {
                        if allow_map.get(&r.key).copied().unwrap_or(false) {
                            active_resource_keys.insert(r.key.clone());
                        }
                    }
                    DomainConfig::new(candidate.name.clone(), candidate.category, candidate.builder.clone())
                } else {
                    info!(domain = %candidate.name, "registering placeholder (requireAny unsatisfied)");
                    DomainConfig::new(candidate.name.clone(), candidate.category, candidate.builder.clone())
                        .permission_denied(Arc::new(crate::snapshot::builder::PlaceholderBuilder::new(
                            candidate.name.clone(),
                        )))
                }
            }
        };

        registry.register(config).await;
    }

    (issues, active_resource_keys)
}

/// Runtime gate: re-checks a non-placeholder domain's
/// requirement against the (SWR) permission cache for the request's scope,
/// returning the allow map the builder should use.
pub async fn ensure_permissions(
    checker: &Arc<PermissionChecker>,
    requirement: &Requirement,
    scope: &Scope,
) -> Result<PermissionMap> {
    let mut allow_map: PermissionMap = HashMap::new();
    for r in requirement.resources() {
        let descriptor = descriptor_for_scope(&r.descriptor, scope);
        let decision = checker.check(&descriptor).await;
        allow_map.insert(r.key.clone(), decision.allowed);
    }

    match requirement {
        Requirement::RequireAll(_) => {
            if allow_map.values().all(|v| *v) {
                Ok(allow_map)
            } else {
                let denied: Vec<_> = allow_map.iter().filter(|(_, v)| !**v).map(|(k, _)| k.clone()).collect();
                Err(Error::PermissionDenied(denied.join(", ")))
            }
        }
        Requirement::RequireAny(_) => {
            if allow_map.values().any(|v| *v) {
                Ok(allow_map)
            } else {
                Err(Error::PermissionDenied("none of the required resources are allowed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManualClock, RefreshConfig};
    use chrono::Utc;
    use http::{Request, Response};
    use kube::client::Body;
    use kube::Client;
    use serde_json::json;

    fn allow_all_client() -> Client {
        let service = tower::service_fn(move |_req: Request<Body>| async move {
            let body = json!({ "status": { "allowed": true } });
            let response = Response::builder()
                .status(201)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string().into_bytes()))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        Client::new(service, "default")
    }

    #[tokio::test]
    async fn require_all_satisfied_registers_real_builder() {
        let checker = Arc::new(crate::permissions::PermissionChecker::new(
            allow_all_client(),
            RefreshConfig::for_tests(),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let registry = DomainRegistry::new();

        let candidate = DomainCandidate {
            name: "namespaces".to_string(),
            category: crate::scope::DomainCategory::Cluster,
            requirement: Requirement::RequireAll(vec![ResourceRequirement::new(
                "core/namespaces",
                PermissionDescriptor::new("list", "", "namespaces"),
            )]),
            builder: Arc::new(crate::snapshot::builder::test_support::StaticBuilder::new(json!({}))),
        };

        let (issues, active_resource_keys) = register_all(&registry, &checker, vec![candidate], Duration::from_secs(1)).await;
        assert!(issues.is_empty());
        assert!(active_resource_keys.contains("core/namespaces"));
        let config = registry.get("namespaces").await.unwrap();
        assert!(!config.permission_denied);
    }

    fn denying_client(allowed_resources: &'static [&'static str]) -> Client {
        let service = tower::service_fn(move |req: Request<Body>| async move {
            let bytes = req.into_body().collect_bytes().await.unwrap();
            let review: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            let resource = review["spec"]["resourceAttributes"]["resource"].as_str().unwrap_or("");
            let allowed = allowed_resources.contains(&resource);
            let body = json!({ "status": { "allowed": allowed } });
            let response = Response::builder()
                .status(201)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string().into_bytes()))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        Client::new(service, "default")
    }

    /// `namespace-rbac` allowed to list serviceaccounts, denied
    /// roles/rolebindings. The domain still registers (requireAny), but
    /// only the allowed resource's key is reported active, and the denied
    /// ones each get a `PermissionIssue`.
    #[tokio::test]
    async fn require_any_partial_reports_only_allowed_resources_as_active() {
        let checker = Arc::new(crate::permissions::PermissionChecker::new(
            denying_client(&["serviceaccounts"]),
            RefreshConfig::for_tests(),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let registry = DomainRegistry::new();

        let candidate = DomainCandidate {
            name: "namespace-rbac".to_string(),
            category: crate::scope::DomainCategory::Namespace,
            requirement: Requirement::RequireAny(vec![
                ResourceRequirement::new("core/serviceaccounts", PermissionDescriptor::new("list", "", "serviceaccounts")),
                ResourceRequirement::new(
                    "rbac.authorization.k8s.io/roles",
                    PermissionDescriptor::new("list", "rbac.authorization.k8s.io", "roles"),
                ),
                ResourceRequirement::new(
                    "rbac.authorization.k8s.io/rolebindings",
                    PermissionDescriptor::new("list", "rbac.authorization.k8s.io", "rolebindings"),
                ),
            ]),
            builder: Arc::new(crate::snapshot::builder::test_support::StaticBuilder::new(json!({}))),
        };

        let (issues, active_resource_keys) =
            register_all(&registry, &checker, vec![candidate], Duration::from_secs(1)).await;

        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.resource == "rbac.authorization.k8s.io/roles"));
        assert!(issues.iter().any(|i| i.resource == "rbac.authorization.k8s.io/rolebindings"));

        assert_eq!(active_resource_keys.len(), 1);
        assert!(active_resource_keys.contains("core/serviceaccounts"));

        let config = registry.get("namespace-rbac").await.unwrap();
        assert!(!config.permission_denied);
    }

    /// A `requireAll` domain with any resource denied becomes a
    /// placeholder; none of its resources should be reported active, so no
    /// informer ever starts for them.
    #[tokio::test]
    async fn require_all_unsatisfied_reports_no_active_resources() {
        let checker = Arc::new(crate::permissions::PermissionChecker::new(
            denying_client(&[]),
            RefreshConfig::for_tests(),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let registry = DomainRegistry::new();

        let candidate = DomainCandidate {
            name: "namespaces".to_string(),
            category: crate::scope::DomainCategory::Cluster,
            requirement: Requirement::RequireAll(vec![ResourceRequirement::new(
                "core/namespaces",
                PermissionDescriptor::new("list", "", "namespaces"),
            )]),
            builder: Arc::new(crate::snapshot::builder::test_support::StaticBuilder::new(json!({}))),
        };

        let (issues, active_resource_keys) =
            register_all(&registry, &checker, vec![candidate], Duration::from_secs(1)).await;

        assert_eq!(issues.len(), 1);
        assert!(active_resource_keys.is_empty());

        let config = registry.get("namespaces").await.unwrap();
        assert!(config.permission_denied);
    }
}
