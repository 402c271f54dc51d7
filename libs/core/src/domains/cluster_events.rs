//! cluster-events: the cluster-wide event feed, sorted by the unified
//! `eventTimestamp`.

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::json;

use crate::domains::event_time::event_timestamp;
use crate::error::{Error, Result};
use crate::permissions::PermissionDescriptor;
use crate::registration::{Requirement, ResourceRequirement};
use crate::scope::Scope;
use crate::snapshot::builder::{BuildContext, DomainBuilder};
use crate::snapshot::types::{BuiltPayload, SnapshotStats};

pub struct ClusterEventsBuilder;

impl ClusterEventsBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn requirement() -> Requirement {
        Requirement::RequireAll(vec![ResourceRequirement::new(
            "core/events",
            PermissionDescriptor::new("list", "", "events"),
        )])
    }
}

impl Default for ClusterEventsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainBuilder for ClusterEventsBuilder {
    async fn build(&self, ctx: &BuildContext) -> Result<BuiltPayload> {
        if !matches!(ctx.scope, Scope::Empty) {
            return Err(Error::InvariantViolation(format!(
                "cluster-events requires the empty scope, got {}",
                ctx.scope
            )));
        }

        let events_store = ctx
            .informers
            .events
            .as_ref()
            .ok_or_else(|| Error::Internal("events informer not started".to_string()))?;

        let mut events = events_store.state();
        events.sort_by_key(|e| event_timestamp(e));

        let entries: Vec<_> = events
            .iter()
            .map(|event| {
                json!({
                    "name": event.name_any(),
                    "namespace": event.namespace().unwrap_or_default(),
                    "reason": event.reason.clone().unwrap_or_default(),
                    "message": event.message.clone().unwrap_or_default(),
                    "type": event.type_.clone().unwrap_or_default(),
                    "involvedObjectKind": event.involved_object.kind.clone().unwrap_or_default(),
                    "involvedObjectName": event.involved_object.name.clone().unwrap_or_default(),
                    "eventTimestamp": event_timestamp(event).to_rfc3339(),
                })
            })
            .collect();

        let stats = SnapshotStats { item_count: entries.len(), ..Default::default() };
        Ok(BuiltPayload::new(json!({ "events": entries }), stats))
    }
}
