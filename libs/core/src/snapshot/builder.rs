//! The `DomainBuilder` trait and the context handed to every builder
//! invocation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::informers::{ClientBundle, InformerSet};
use crate::scope::Scope;
use crate::snapshot::types::{BuiltPayload, PermissionMap};

/// Everything a builder needs to produce one `BuiltPayload`: the parsed
/// scope, a bounded timeout, the per-resource allow map (for `requireAny`
/// domains), and handles to the informer caches / live client.
pub struct BuildContext {
    pub scope: Scope,
    pub timeout: Duration,
    pub permissions: Arc<PermissionMap>,
    pub informers: Arc<InformerSet>,
    pub client_bundle: Arc<ClientBundle>,
    pub cancellation: CancellationToken,
}

impl BuildContext {
    /// Whether `resource` is allowed per the primed permission map. Domains
    /// registered with `requireAll` never reach a builder unless every
    /// resource is allowed, so this is mostly consulted by `requireAny`
    /// builders deciding whether to read a given lister.
    pub fn resource_allowed(&self, resource: &str) -> bool {
        self.permissions.get(resource).copied().unwrap_or(false)
    }
}

/// A named domain's snapshot-building logic. Implementations must respect
/// `ctx.cancellation` at every external call and must produce deterministic
/// ordering for repeated items so `etag` is stable across rebuilds that
/// produce identical output.
#[async_trait]
pub trait DomainBuilder: Send + Sync {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload>;
}

/// Substituted for the real builder by the registration pipeline when a
/// `requireAll` domain is missing a required permission, or a `requireAny`
/// domain has none of its candidate resources allowed. Never performs a
/// Kubernetes call; always returns `PermissionDenied`.
pub struct PlaceholderBuilder {
    domain: String,
}

impl PlaceholderBuilder {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

#[async_trait]
impl DomainBuilder for PlaceholderBuilder {
    async fn build(&self, _ctx: &BuildContext) -> Result<BuiltPayload> {
        Err(crate::error::Error::PermissionDenied(self.domain.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ClusterId;
    use std::collections::HashMap;

    fn mock_client() -> kube::Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(http::Response::builder().status(200).body(kube::client::Body::empty()).unwrap())
        });
        kube::Client::new(service, "default")
    }

    fn ctx(permissions: HashMap<String, bool>) -> BuildContext {
        BuildContext {
            scope: Scope::Empty,
            timeout: Duration::from_secs(1),
            permissions: Arc::new(permissions),
            informers: Arc::new(InformerSet::default()),
            client_bundle: Arc::new(ClientBundle::new(ClusterId::new("test:ctx"), mock_client(), false)),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn placeholder_builder_always_returns_permission_denied() {
        let result = PlaceholderBuilder::new("namespace-rbac").build(&ctx(HashMap::new())).await;
        assert!(matches!(result, Err(crate::error::Error::PermissionDenied(domain)) if domain == "namespace-rbac"));
    }

    #[test]
    fn resource_allowed_defaults_to_false_for_unknown_resources() {
        let ctx = ctx(HashMap::new());
        assert!(!ctx.resource_allowed("core/pods"));
    }

    #[test]
    fn resource_allowed_reflects_the_permission_map() {
        let mut permissions = HashMap::new();
        permissions.insert("core/pods".to_string(), true);
        let ctx = ctx(permissions);
        assert!(ctx.resource_allowed("core/pods"));
        assert!(!ctx.resource_allowed("apps/deployments"));
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use crate::snapshot::types::SnapshotStats;
    use serde_json::Value;

    /// A builder that always returns the same payload; used in registry and
    /// snapshot-service unit tests where the actual Kubernetes-reading logic
    /// is irrelevant.
    pub struct StaticBuilder {
        payload: Value,
    }

    impl StaticBuilder {
        pub fn new(payload: Value) -> Self {
            Self { payload }
        }
    }

    #[async_trait]
    impl DomainBuilder for StaticBuilder {
        async fn build(&self, _ctx: &BuildContext) -> Result<BuiltPayload> {
            Ok(BuiltPayload::new(self.payload.clone(), SnapshotStats::default()))
        }
    }
}
