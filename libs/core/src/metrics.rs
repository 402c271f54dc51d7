//! Prometheus metrics for the refresh subsystem, grounded on this codebase's
//! reconcile-metrics module: the same `Family`/`Counter`/
//! `HistogramWithExemplars`/`TraceLabel`/measure-via-`Drop` idiom, widened
//! from one reconcile loop to per-domain snapshot builds, permission checks,
//! stream subscribers, and manual refresh jobs.

use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::error::Error;
use crate::permissions::DecisionSource;

#[derive(Clone)]
pub struct Metrics {
    pub snapshots: SnapshotMetrics,
    pub permissions: PermissionMetrics,
    pub streams: StreamMetrics,
    pub jobs: JobMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::with_registry(Registry::with_prefix("kubevista"))
    }
}

impl Metrics {
    /// Registers the refresh subsystem's metrics into a caller-supplied
    /// registry, so the binary can fold in the kube client's own request
    /// metrics (registered via `new_client_with_metrics`) under the same
    /// `/metrics` endpoint instead of serving two separate registries.
    pub fn with_registry(mut registry: Registry) -> Self {
        let snapshots = SnapshotMetrics::default().register(&mut registry);
        let permissions = PermissionMetrics::default().register(&mut registry);
        let streams = StreamMetrics::default().register(&mut registry);
        let jobs = JobMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            snapshots,
            permissions,
            streams,
            jobs,
        }
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry).unwrap();
        buffer
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DomainLabel {
    pub domain: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DomainErrorLabel {
    pub domain: String,
    pub error: String,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SourceLabelValue {
    Fresh,
    Cache,
    Stale,
    Fallback,
}

impl From<DecisionSource> for SourceLabelValue {
    fn from(source: DecisionSource) -> Self {
        match source {
            DecisionSource::Fresh => SourceLabelValue::Fresh,
            DecisionSource::Cache => SourceLabelValue::Cache,
            DecisionSource::Stale => SourceLabelValue::Stale,
            DecisionSource::Fallback => SourceLabelValue::Fallback,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PermissionCheckLabel {
    pub source: SourceLabelValue,
    pub allowed: bool,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobStateValue {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobStateLabel {
    pub state: JobStateValue,
}

/// `kubevista_snapshot_build_duration_seconds` / `_build_failures_total`.
#[derive(Clone)]
pub struct SnapshotMetrics {
    pub builds: Family<DomainLabel, Counter>,
    pub failures: Family<DomainErrorLabel, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        Self {
            builds: Family::<DomainLabel, Counter>::default(),
            failures: Family::<DomainErrorLabel, Counter>::default(),
            duration: HistogramWithExemplars::new([0.01, 0.05, 0.1, 0.5, 1., 2.5, 5., 10.].into_iter()),
        }
    }
}

impl SnapshotMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("build_duration", "snapshot build duration", Unit::Seconds, self.duration.clone());
        r.register("build_failures", "failed snapshot builds", self.failures.clone());
        r.register("builds", "completed snapshot builds", self.builds.clone());
        self
    }

    pub fn record_failure(&self, domain: &str, error: &Error) {
        self.failures
            .get_or_create(&DomainErrorLabel {
                domain: domain.to_string(),
                error: error.to_string(),
            })
            .inc();
    }

    /// Counts a build attempt and starts a duration measurer that records
    /// on drop, mirroring the reconcile-loop's count-and-measure idiom.
    pub fn count_and_measure(&self, domain: &str, trace_id: &TraceId) -> SnapshotMeasurer {
        self.builds.get_or_create(&DomainLabel { domain: domain.to_string() }).inc();
        SnapshotMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Measures one snapshot build's wall-clock duration via `Drop`.
pub struct SnapshotMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for SnapshotMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

/// `kubevista_permission_checks_total`.
#[derive(Clone, Default)]
pub struct PermissionMetrics {
    pub checks: Family<PermissionCheckLabel, Counter>,
}

impl PermissionMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register("permission_checks", "permission decisions returned", self.checks.clone());
        self
    }

    pub fn record(&self, source: DecisionSource, allowed: bool) {
        self.checks
            .get_or_create(&PermissionCheckLabel {
                source: source.into(),
                allowed,
            })
            .inc();
    }
}

/// `kubevista_stream_subscribers`.
#[derive(Clone, Default)]
pub struct StreamMetrics {
    pub subscribers: Family<DomainLabel, Gauge>,
}

impl StreamMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register("stream_subscribers", "active stream subscribers", self.subscribers.clone());
        self
    }

    pub fn set_subscribers(&self, domain: &str, count: i64) {
        self.subscribers.get_or_create(&DomainLabel { domain: domain.to_string() }).set(count);
    }
}

/// `kubevista_manual_jobs_total`.
#[derive(Clone, Default)]
pub struct JobMetrics {
    pub total: Family<JobStateLabel, Counter>,
}

impl JobMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register("manual_jobs", "completed manual refresh jobs by outcome", self.total.clone());
        self
    }

    pub fn record(&self, state: JobStateValue) {
        self.total.get_or_create(&JobStateLabel { state }).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_trace_id_is_rejected() {
        let result: Result<TraceLabel, Error> = (&TraceId::INVALID).try_into();
        assert!(matches!(result, Err(Error::InvalidTraceId)));
    }

    #[test]
    fn metrics_default_registers_without_panicking() {
        let metrics = Metrics::default();
        metrics.snapshots.builds.get_or_create(&DomainLabel { domain: "cluster-overview".into() }).inc();
        metrics.permissions.record(DecisionSource::Cache, true);
        metrics.streams.set_subscribers("cluster-overview", 3);
        metrics.jobs.record(JobStateValue::Succeeded);
    }
}
