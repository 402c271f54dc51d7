//! The snapshot service: the single entry point for
//! producing a `(domain, scope)` snapshot, cached and singleflight-deduped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{info_span, Instrument};

use crate::config::{Clock, RefreshConfig};
use crate::error::{Error, Result};
use crate::informers::{ClientBundle, InformerSet};
use crate::metrics::Metrics;
use crate::permissions::PermissionChecker;
use crate::registration::{self, Requirement};
use crate::registry::DomainRegistry;
use crate::scope::{DomainCategory, Scope};
use crate::singleflight::SingleFlight;
use crate::snapshot::builder::BuildContext;
use crate::snapshot::types::{BuildOptions, CacheEntry, PermissionMap, Snapshot, SnapshotStats};
use crate::telemetry_recorder::TelemetryRecorder;

fn cache_key(domain: &str, scope: &Scope, bypass_cache: bool) -> String {
    // Includes the bypass flag so a bypass caller never shares a
    // singleflight group (or a cached entry) with a non-bypass caller.
    format!("{domain}\u{1}{scope}\u{1}{bypass_cache}")
}

fn category_ttl(config: &RefreshConfig, category: DomainCategory) -> std::time::Duration {
    match category {
        DomainCategory::System => config.category_ttls.system,
        DomainCategory::Cluster => config.category_ttls.cluster,
        DomainCategory::Namespace => config.category_ttls.namespace,
        DomainCategory::Object => config.category_ttls.object,
    }
}

pub struct SnapshotService {
    registry: Arc<DomainRegistry>,
    checker: Arc<PermissionChecker>,
    informers: Arc<InformerSet>,
    client_bundle: Arc<ClientBundle>,
    requirements: HashMap<String, Arc<Requirement>>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetryRecorder>,
    metrics: Arc<Metrics>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    versions: RwLock<HashMap<String, u64>>,
    singleflight: SingleFlight<String, Arc<Result<Snapshot>>>,
}

impl SnapshotService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DomainRegistry>,
        checker: Arc<PermissionChecker>,
        informers: Arc<InformerSet>,
        client_bundle: Arc<ClientBundle>,
        requirements: HashMap<String, Arc<Requirement>>,
        config: RefreshConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Self {
        Self::with_metrics(
            registry,
            checker,
            informers,
            client_bundle,
            requirements,
            config,
            clock,
            telemetry,
            Arc::new(Metrics::default()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_metrics(
        registry: Arc<DomainRegistry>,
        checker: Arc<PermissionChecker>,
        informers: Arc<InformerSet>,
        client_bundle: Arc<ClientBundle>,
        requirements: HashMap<String, Arc<Requirement>>,
        config: RefreshConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<TelemetryRecorder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            checker,
            informers,
            client_bundle,
            requirements,
            config,
            clock,
            telemetry,
            metrics,
            cache: RwLock::new(HashMap::new()),
            versions: RwLock::new(HashMap::new()),
            singleflight: SingleFlight::new(),
        }
    }

    /// `Build(domain, scope, options) -> Snapshot | Error`.
    pub async fn build(self: &Arc<Self>, domain: &str, scope: Scope, options: BuildOptions) -> Result<Snapshot> {
        let config = self
            .registry
            .get(domain)
            .await
            .ok_or_else(|| Error::UnknownDomain(domain.to_string()))?;

        if config.permission_denied {
            return Err(Error::PermissionDenied(domain.to_string()));
        }

        let permissions = if let Some(requirement) = self.requirements.get(domain) {
            registration::ensure_permissions(&self.checker, requirement, &scope).await?
        } else {
            PermissionMap::new()
        };

        let key = cache_key(domain, &scope, options.bypass_cache);

        if !options.bypass_cache {
            if let Some(entry) = self.cache.read().await.get(&key).cloned() {
                if entry.is_fresh(self.clock.now()) {
                    return Ok(entry.snapshot);
                }
            }
        }

        let this = self.clone();
        let domain_owned = domain.to_string();
        let scope_for_build = scope.clone();
        let result = self
            .singleflight
            .run(key.clone(), async move {
                Arc::new(
                    this.build_uncached(&domain_owned, scope_for_build, config, permissions)
                        .instrument(info_span!("snapshot_build", domain = %domain_owned))
                        .await,
                )
            })
            .await;

        match result.as_ref() {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(e) => Err(e.fanout_clone()),
        }
    }

    async fn build_uncached(
        self: Arc<Self>,
        domain: &str,
        scope: Scope,
        config: crate::registry::DomainConfig,
        permissions: PermissionMap,
    ) -> Result<Snapshot> {
        let started = Instant::now();
        let trace_id = crate::telemetry::get_trace_id();
        let measurer = self.metrics.snapshots.count_and_measure(domain, &trace_id);
        let ctx = BuildContext {
            scope: scope.clone(),
            timeout: self.config.build_timeout,
            permissions: Arc::new(permissions),
            informers: self.informers.clone(),
            client_bundle: self.client_bundle.clone(),
            cancellation: tokio_util::sync::CancellationToken::new(),
        };

        let build_result = tokio::time::timeout(self.config.build_timeout, config.builder.build(&ctx)).await;
        drop(measurer);

        let built = match build_result {
            Ok(Ok(built)) => built,
            Ok(Err(e)) => {
                self.telemetry.record_failure(domain, &scope.to_string()).await;
                self.metrics.snapshots.record_failure(domain, &e);
                return Err(e);
            }
            Err(_) => {
                self.telemetry.record_failure(domain, &scope.to_string()).await;
                let error = Error::Timeout(format!("build timed out for {domain}"));
                self.metrics.snapshots.record_failure(domain, &error);
                return Err(error);
            }
        };

        let duration = started.elapsed();
        let key = format!("{domain}\u{1}{scope}");
        let version = {
            let mut versions = self.versions.write().await;
            let next = versions.get(&key).copied().unwrap_or(0) + 1;
            versions.insert(key.clone(), next);
            next
        };

        let etag = Snapshot::fingerprint(&built.payload);
        let mut stats = built.stats;
        stats.build_duration = duration;

        let snapshot = Snapshot {
            version,
            generated_at: self.clock.utc_now(),
            payload: built.payload,
            stats,
            etag,
        };

        let ttl = category_ttl(&self.config, config.category);
        self.cache.write().await.insert(
            cache_key(domain, &scope, false),
            CacheEntry::new(snapshot.clone(), ttl, self.clock.now()),
        );

        self.telemetry.record_success(domain, &scope.to_string(), duration).await;
        Ok(snapshot)
    }

    /// Forces a fresh build, bypassing the cache entirely. Used by the
    /// manual refresh queue: the bypass-cache key keeps this on its own
    /// singleflight group, distinct from any concurrent non-bypass caller.
    pub async fn force_rebuild(self: &Arc<Self>, domain: &str, scope: Scope) -> Result<Snapshot> {
        self.build(domain, scope, BuildOptions { bypass_cache: true, manual_refresh: true }).await
    }

    pub async fn stats_for(&self, domain: &str, scope: &Scope) -> Option<SnapshotStats> {
        self.cache
            .read()
            .await
            .get(&cache_key(domain, scope, false))
            .map(|e| e.snapshot.stats.clone())
    }
}
