//! ephemeral-debug: attach an ephemeral debug container to a running pod and
//! wait for it to reach `Running`. This is a one-shot mutate-then-poll
//! action, not a cacheable snapshot, so it is a plain async function rather
//! than a `DomainBuilder` — the subsystem exposes it directly instead of
//! routing it through the registry/cache/singleflight pipeline.

use std::time::Duration;

use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::snapshot::builder::BuildContext;

/// Attaches a debug container and polls until it reaches `Running`, using
/// the poll interval/timeout from `RefreshConfig` (the subsystem passes
/// these through rather than this module hardcoding its own defaults).
pub async fn create_debug_container(
    ctx: &BuildContext,
    image: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let (namespace, pod_name) = match &ctx.scope {
        Scope::Object { kind, namespace, name } if kind == "Pod" => (namespace.clone(), name.clone()),
        other => {
            return Err(Error::InvariantViolation(format!(
                "ephemeral-debug requires a Pod object scope, got {other}"
            )))
        }
    };

    let container_name = format!("debug-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let api: Api<Pod> = Api::namespaced(ctx.client_bundle.client.clone(), &namespace);

    let container = EphemeralContainer {
        name: container_name.clone(),
        image: Some(image.to_string()),
        stdin: Some(true),
        tty: Some(true),
        ..Default::default()
    };
    let patch = json!({
        "spec": {
            "ephemeralContainers": [container]
        }
    });

    api.patch_subresource("ephemeralcontainers", &pod_name, &PatchParams::default(), &Patch::Strategic(&patch))
        .await
        .map_err(Error::Kube)?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pod = api.get(&pod_name).await.map_err(Error::Kube)?;
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.ephemeral_container_statuses.as_ref())
            .into_iter()
            .flatten()
            .find(|status| status.name == container_name)
            .and_then(|status| status.state.as_ref())
            .map(|state| state.running.is_some())
            .unwrap_or(false);

        if running {
            return Ok(json!({
                "containerName": container_name,
                "podName": pod_name,
                "namespace": namespace,
            }));
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "ephemeral debug container {container_name} did not reach Running before the deadline"
            )));
        }

        if ctx.cancellation.is_cancelled() {
            return Err(Error::Timeout(format!(
                "ephemeral debug container {container_name} creation was cancelled"
            )));
        }

        tokio::time::sleep(poll_interval).await;
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

    fn ctx(scope: Scope) -> BuildContext {
        BuildContext {
            scope,
            timeout: std::time::Duration::from_secs(1),
            permissions: Arc::new(std::collections::HashMap::new()),
            informers: Arc::new(InformerSet::default()),
            client_bundle: Arc::new(ClientBundle::new(ClusterId::new("test:ctx"), mock_client(), false)),
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn non_pod_object_scope_is_rejected_before_any_patch() {
        let scope = Scope::Object { kind: "Service".to_string(), namespace: "team-a".to_string(), name: "web".to_string() };
        let result = create_debug_container(&ctx(scope), "busybox", Duration::from_millis(5), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn non_object_scope_is_rejected() {
        let result = create_debug_container(
            &ctx(Scope::Namespace("team-a".to_string())),
            "busybox",
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
    }
}
