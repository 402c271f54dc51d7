//! The permission checker: SSAR probing behind a two-tier
//! fresh/stale-while-revalidate cache, singleflight-coalesced, with
//! transient-error fallback to stale data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{Clock, RefreshConfig};
use crate::error::{Error, KubeErrorClass};
use crate::metrics::Metrics;
use crate::permissions::cache::{CacheEntry, DecisionSource, EntryState, PermissionDecision};
use crate::permissions::descriptor::PermissionDescriptor;
use crate::singleflight::SingleFlight;

/// Splits `descriptors` into chunks of at most `RefreshConfig::permission_batch_chunk_size`
/// so a single pre-flight probe can't send an unbounded number of SSAR
/// calls at once.
pub fn chunk_descriptors(
    descriptors: &[PermissionDescriptor],
    chunk_size: usize,
) -> Vec<Vec<PermissionDescriptor>> {
    if chunk_size == 0 {
        return vec![descriptors.to_vec()];
    }
    descriptors
        .chunks(chunk_size)
        .map(|c| c.to_vec())
        .collect()
}

pub struct PermissionChecker {
    client: Client,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    singleflight: SingleFlight<String, PermissionDecision>,
    refreshing: RwLock<HashSet<String>>,
}

impl PermissionChecker {
    pub fn new(client: Client, config: RefreshConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(client, config, clock, Arc::new(Metrics::default()))
    }

    pub fn with_metrics(client: Client, config: RefreshConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            config,
            clock,
            metrics,
            cache: RwLock::new(HashMap::new()),
            singleflight: SingleFlight::new(),
            refreshing: RwLock::new(HashSet::new()),
        }
    }

    /// Looks up or evaluates a single descriptor. Stale-while-revalidate
    /// reads spawn their background refresh on the tokio runtime, so `self`
    /// must be held behind an `Arc` (every long-lived owner — the
    /// registration pipeline and domain builders — does).
    pub async fn check(self: &Arc<Self>, descriptor: &PermissionDescriptor) -> PermissionDecision {
        let canonical = descriptor.canonicalize();
        let key = canonical.cache_key();

        let mut expired_fallback = None;
        if let Some(entry) = self.cache.read().await.get(&key).cloned() {
            match entry.state(
                self.clock.as_ref(),
                self.config.permission_ttl_fresh,
                self.config.permission_ttl_grace,
            ) {
                EntryState::Fresh => {
                    let decision = entry.decision_as(DecisionSource::Cache);
                    self.metrics.permissions.record(decision.source, decision.allowed);
                    return decision;
                }
                EntryState::Stale => {
                    self.refresh_now(canonical).await;
                    let decision = entry.decision_as(DecisionSource::Stale);
                    self.metrics.permissions.record(decision.source, decision.allowed);
                    return decision;
                }
                EntryState::Expired => {
                    // Kept as a fallback for `fetch_and_cache` rather than
                    // removed here: a transient SSAR failure right as an
                    // entry crosses into `Expired` should still serve the
                    // last-known decision instead of surfacing an error.
                    expired_fallback = Some(entry);
                }
            }
        }

        let decision = self.fetch_and_cache(canonical, key, expired_fallback).await;
        self.metrics.permissions.record(decision.source, decision.allowed);
        decision
    }

    /// Batched convenience: deduplicates internally and issues requests in
    /// chunks of `permission_batch_chunk_size`.
    pub async fn check_many(
        self: &Arc<Self>,
        descriptors: &[PermissionDescriptor],
    ) -> HashMap<String, PermissionDecision> {
        let mut seen: HashMap<String, PermissionDescriptor> = HashMap::new();
        for d in descriptors {
            let canonical = d.canonicalize();
            seen.entry(canonical.cache_key()).or_insert(canonical);
        }
        let unique: Vec<_> = seen.into_values().collect();

        let mut results = HashMap::new();
        for chunk in chunk_descriptors(&unique, self.config.permission_batch_chunk_size) {
            let futures = chunk.into_iter().map(|d| {
                let this = self.clone();
                async move {
                    let key = d.cache_key();
                    let decision = this.check(&d).await;
                    (key, decision)
                }
            });
            for (key, decision) in futures::future::join_all(futures).await {
                results.insert(key, decision);
            }
        }
        results
    }

    /// Drops cache entries matching `predicate` (keyed by canonical cache key).
    pub async fn invalidate<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool,
    {
        let mut cache = self.cache.write().await;
        cache.retain(|k, _| !predicate(k));
    }

    /// Fire-and-forget cache warm-up used during subsystem startup.
    pub async fn prime(self: &Arc<Self>, descriptors: &[PermissionDescriptor]) {
        self.check_many(descriptors).await;
    }

    /// Pre-flight probing with a wall timeout. Unlike
    /// `prime`, this awaits completion (bounded by `timeout`) so the
    /// registration pipeline can evaluate results immediately afterward.
    pub async fn prime_with_timeout(self: &Arc<Self>, descriptors: &[PermissionDescriptor], timeout: Duration) {
        if tokio::time::timeout(timeout, self.check_many(descriptors))
            .await
            .is_err()
        {
            warn!(
                count = descriptors.len(),
                "permission pre-flight probing exceeded wall timeout; unresolved \
                 descriptors will be evaluated lazily on first use"
            );
        }
    }

    /// Performs a background refresh for `descriptor` right now, unless one
    /// is already running for the same cache key.
    async fn refresh_now(self: &Arc<Self>, descriptor: PermissionDescriptor) {
        let key = descriptor.cache_key();
        {
            let mut refreshing = self.refreshing.write().await;
            if refreshing.contains(&key) {
                return;
            }
            refreshing.insert(key.clone());
        }

        let this = self.clone();
        let key_for_cleanup = key.clone();
        tokio::spawn(async move {
            let _ = this.fetch_and_cache(descriptor, key_for_cleanup.clone(), None).await;
            this.refreshing.write().await.remove(&key_for_cleanup);
        });
    }

    /// Issues (or joins, via singleflight) an SSAR for `canonical` and
    /// caches the result. `fallback`, when given, is the last-known entry
    /// for `key` (typically one that just crossed into `Expired`): on a
    /// transient failure it is served back with `source = Fallback` and the
    /// stale entry is dropped from the cache; on success the fresh result
    /// simply overwrites it.
    async fn fetch_and_cache(
        &self,
        canonical: PermissionDescriptor,
        key: String,
        fallback: Option<CacheEntry>,
    ) -> PermissionDecision {
        let ssar_timeout = self.config.permission_ssar_timeout;
        let client = self.client.clone();
        let canonical_for_fetch = canonical.clone();
        let evaluated_at = self.clock.utc_now();

        let decision = self
            .singleflight
            .run(key.clone(), async move {
                fetch_decision(client, canonical_for_fetch, ssar_timeout, evaluated_at).await
            })
            .await;

        if decision.evaluation_error.is_some() {
            if let Some(stale) = fallback {
                self.cache.write().await.remove(&key);
                return stale.decision_as(DecisionSource::Fallback);
            }
            return decision;
        }

        let inserted_at = self.clock.now();
        self.cache
            .write()
            .await
            .insert(key, CacheEntry::new(decision.clone(), inserted_at));
        decision
    }
}

async fn fetch_decision(
    client: Client,
    descriptor: PermissionDescriptor,
    timeout: Duration,
    evaluated_at: chrono::DateTime<chrono::Utc>,
) -> PermissionDecision {
    let api: Api<SelfSubjectAccessReview> = Api::all(client);
    let attributes = ResourceAttributes {
        group: Some(descriptor.group.clone()),
        resource: Some(descriptor.resource.clone()),
        subresource: descriptor.subresource.clone(),
        verb: Some(descriptor.verb.clone()),
        namespace: descriptor.namespace.clone(),
        name: descriptor.name.clone(),
        ..Default::default()
    };
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(attributes),
            ..Default::default()
        },
        ..Default::default()
    };

    let call = api.create(&PostParams::default(), &review);
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(response)) => {
            let status = response.status;
            let allowed = status.as_ref().map(|s| s.allowed).unwrap_or(false);
            if allowed {
                PermissionDecision::allowed(DecisionSource::Fresh, evaluated_at)
            } else {
                let reason = status
                    .and_then(|s| s.reason)
                    .unwrap_or_else(|| "denied by RBAC".to_string());
                PermissionDecision::denied(reason, DecisionSource::Fresh, evaluated_at)
            }
        }
        Ok(Err(kube_err)) => match Error::classify_kube(&kube_err) {
            KubeErrorClass::Transient => {
                debug!(error = %kube_err, "transient SSAR failure");
                PermissionDecision::error(format!("transient: {kube_err}"), evaluated_at)
            }
            KubeErrorClass::PermanentDenied | KubeErrorClass::Permanent => {
                PermissionDecision::denied(format!("{kube_err}"), DecisionSource::Fresh, evaluated_at)
            }
        },
        Err(_) => PermissionDecision::error("SSAR call timed out", evaluated_at),
    }
}
