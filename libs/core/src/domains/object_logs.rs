//! object-logs: a cacheable batch fetch of recent log lines for one pod
//! container. The live-tailing connect handshake (reset envelope, then this
//! batch, then a background follower publishing deltas) is a subsystem-level
//! stream concern, not part of this builder — a build here is a single
//! point-in-time fetch, consistent with the rest of the snapshot/cache
//! machinery. Grounded on the `log_stream`/line-pump pattern used for pod
//! log tailing elsewhere in the retrieved pack.

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use kube::api::{Api, LogParams};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::permissions::PermissionDescriptor;
use crate::registration::{Requirement, ResourceRequirement};
use crate::scope::Scope;
use crate::snapshot::builder::{BuildContext, DomainBuilder};
use crate::snapshot::types::{BuiltPayload, SnapshotStats};

const DEFAULT_TAIL_LINES: i64 = 200;

pub struct ObjectLogsBuilder;

impl ObjectLogsBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn requirement() -> Requirement {
        Requirement::RequireAll(vec![ResourceRequirement::new(
            "core/pods/log",
            PermissionDescriptor::new("get", "", "pods").with_subresource("log"),
        )])
    }
}

impl Default for ObjectLogsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches up to `tail_lines` of recent log output for the pod named in
/// `ctx.scope` (an object scope whose `kind` is always `"Pod"` for this
/// domain) and returns it as a JSON array of lines, newest last.
pub async fn fetch_batch(ctx: &BuildContext, tail_lines: i64) -> Result<Value> {
    let (namespace, name) = match &ctx.scope {
        Scope::Object { kind, namespace, name } if kind == "Pod" => (namespace.clone(), name.clone()),
        other => {
            return Err(Error::InvariantViolation(format!(
                "object-logs requires a Pod object scope, got {other}"
            )))
        }
    };

    let api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(ctx.client_bundle.client.clone(), &namespace);
    let params = LogParams {
        tail_lines: Some(tail_lines),
        follow: false,
        timestamps: true,
        ..Default::default()
    };

    let stream = api
        .log_stream(&name, &params)
        .await
        .map_err(Error::Kube)?;

    let mut lines = Vec::new();
    let mut reader = stream.lines();
    while let Some(line) = reader.try_next().await.map_err(|e| Error::Internal(e.to_string()))? {
        lines.push(json!(line));
    }

    Ok(json!({ "lines": lines }))
}

#[async_trait]
impl DomainBuilder for ObjectLogsBuilder {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload> {
        let payload = fetch_batch(ctx, DEFAULT_TAIL_LINES).await?;
        let item_count = payload.get("lines").and_then(|l| l.as_array()).map(|a| a.len()).unwrap_or(0);
        Ok(BuiltPayload::new(payload, SnapshotStats { item_count, ..Default::default() }))
    }
}
