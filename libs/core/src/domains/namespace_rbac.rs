//! namespace-rbac: the `requireAny` partial-data demonstrator. Reports
//! whichever of {serviceaccounts, roles, rolebindings} this identity is
//! allowed to list in the target namespace; a denied resource is simply
//! absent from the payload, never an error.

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::permissions::PermissionDescriptor;
use crate::registration::{Requirement, ResourceRequirement};
use crate::scope::Scope;
use crate::snapshot::builder::{BuildContext, DomainBuilder};
use crate::snapshot::types::{BuiltPayload, SnapshotStats};

pub struct NamespaceRbacBuilder;

impl NamespaceRbacBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn requirement() -> Requirement {
        Requirement::RequireAny(vec![
            ResourceRequirement::new("core/serviceaccounts", PermissionDescriptor::new("list", "", "serviceaccounts")),
            ResourceRequirement::new(
                "rbac.authorization.k8s.io/roles",
                PermissionDescriptor::new("list", "rbac.authorization.k8s.io", "roles"),
            ),
            ResourceRequirement::new(
                "rbac.authorization.k8s.io/rolebindings",
                PermissionDescriptor::new("list", "rbac.authorization.k8s.io", "rolebindings"),
            ),
        ])
    }
}

impl Default for NamespaceRbacBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainBuilder for NamespaceRbacBuilder {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload> {
        let namespace = match &ctx.scope {
            Scope::Namespace(ns) => ns.clone(),
            other => {
                return Err(Error::InvariantViolation(format!(
                    "namespace-rbac requires a namespace scope, got {other}"
                )))
            }
        };

        let mut payload = serde_json::Map::new();
        let mut item_count = 0usize;
        let mut source_flags = std::collections::HashMap::new();

        if ctx.resource_allowed("core/serviceaccounts") {
            let names: Vec<Value> = ctx
                .informers
                .serviceaccounts
                .as_ref()
                .map(|store| {
                    store
                        .state()
                        .iter()
                        .filter(|sa| sa.namespace().as_deref() == Some(namespace.as_str()))
                        .map(|sa| json!(sa.name_any()))
                        .collect()
                })
                .unwrap_or_default();
            item_count += names.len();
            payload.insert("serviceAccounts".to_string(), Value::Array(names));
            source_flags.insert("serviceAccounts".to_string(), true);
        }

        if ctx.resource_allowed("rbac.authorization.k8s.io/roles") {
            let names: Vec<Value> = ctx
                .informers
                .roles
                .as_ref()
                .map(|store| {
                    store
                        .state()
                        .iter()
                        .filter(|r| r.namespace().as_deref() == Some(namespace.as_str()))
                        .map(|r| json!(r.name_any()))
                        .collect()
                })
                .unwrap_or_default();
            item_count += names.len();
            payload.insert("roles".to_string(), Value::Array(names));
            source_flags.insert("roles".to_string(), true);
        }

        if ctx.resource_allowed("rbac.authorization.k8s.io/rolebindings") {
            let names: Vec<Value> = ctx
                .informers
                .rolebindings
                .as_ref()
                .map(|store| {
                    store
                        .state()
                        .iter()
                        .filter(|rb| rb.namespace().as_deref() == Some(namespace.as_str()))
                        .map(|rb| json!(rb.name_any()))
                        .collect()
                })
                .unwrap_or_default();
            item_count += names.len();
            payload.insert("roleBindings".to_string(), Value::Array(names));
            source_flags.insert("roleBindings".to_string(), true);
        }

        let stats = SnapshotStats { item_count, source_flags, ..Default::default() };
        Ok(BuiltPayload::new(Value::Object(payload), stats))
    }
}
