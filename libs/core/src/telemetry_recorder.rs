//! Per-`(domain, scope)` telemetry: timings, error counts,
//! no alerting, just observability. Grounded on this codebase's
//! `Diagnostics` pattern (an `Arc<RwLock<_>>` read by the web server).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct DomainTelemetry {
    pub last_connect: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_build_duration: Option<Duration>,
    pub last_build_completed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub in_flight_checks: Vec<String>,
}

impl Default for DomainTelemetry {
    fn default() -> Self {
        Self {
            last_connect: None,
            last_event: None,
            error_count: 0,
            last_build_duration: None,
            last_build_completed_at: None,
            consecutive_failures: 0,
            in_flight_checks: Vec::new(),
        }
    }
}

fn key(domain: &str, scope: &str) -> String {
    format!("{domain}\u{1}{scope}")
}

/// Shared, per-subsystem telemetry state. Cheap to read (a summary clone) so
/// the transport can poll it for `/api/v2/telemetry/summary`.
pub struct TelemetryRecorder {
    entries: RwLock<HashMap<String, DomainTelemetry>>,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record_success(&self, domain: &str, scope: &str, duration: Duration) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key(domain, scope)).or_default();
        entry.last_build_duration = Some(duration);
        entry.last_build_completed_at = Some(Utc::now());
        entry.consecutive_failures = 0;
    }

    pub async fn record_failure(&self, domain: &str, scope: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key(domain, scope)).or_default();
        entry.error_count += 1;
        entry.consecutive_failures += 1;
    }

    pub async fn record_connect(&self, domain: &str, scope: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key(domain, scope)).or_default();
        entry.last_connect = Some(Utc::now());
    }

    pub async fn record_event(&self, domain: &str, scope: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key(domain, scope)).or_default();
        entry.last_event = Some(Utc::now());
    }

    /// A serializable summary for `TelemetrySummary()`.
    pub async fn summary(&self) -> HashMap<String, DomainTelemetry> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.replace('\u{1}', "/"), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_increments_error_and_consecutive_counts() {
        let recorder = TelemetryRecorder::new();
        recorder.record_failure("namespace-workloads", "namespace:team-a").await;
        recorder.record_failure("namespace-workloads", "namespace:team-a").await;
        let summary = recorder.summary().await;
        let entry = summary.get("namespace-workloads/namespace:team-a").unwrap();
        assert_eq!(entry.error_count, 2);
        assert_eq!(entry.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let recorder = TelemetryRecorder::new();
        recorder.record_failure("d", "s").await;
        recorder.record_success("d", "s", Duration::from_millis(10)).await;
        let summary = recorder.summary().await;
        assert_eq!(summary.get("d/s").unwrap().consecutive_failures, 0);
    }
}
