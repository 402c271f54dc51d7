//! Snapshot, cache entry, and build option types.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A typed payload produced for one `(domain, scope)`, opaque to the core.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub payload: Value,
    pub stats: SnapshotStats,
    pub etag: String,
}

impl Snapshot {
    /// Computes a content-addressed fingerprint of `payload`, stable across
    /// rebuilds that produce identical output: re-building with no
    /// intervening state change returns the same etag.
    pub fn fingerprint(payload: &Value) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        payload.to_string().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Build statistics recorded alongside every snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotStats {
    pub build_duration: Duration,
    pub item_count: usize,
    pub batch_count: usize,
    /// Which optional data sources contributed (e.g. `{"metrics": false}`
    /// for cluster-overview when no metrics client is wired).
    pub source_flags: HashMap<String, bool>,
}

/// What a builder returns; the service wraps this into a versioned,
/// timestamped, fingerprinted `Snapshot`.
#[derive(Debug, Clone)]
pub struct BuiltPayload {
    pub payload: Value,
    pub stats: SnapshotStats,
}

impl BuiltPayload {
    pub fn new(payload: Value, stats: SnapshotStats) -> Self {
        Self { payload, stats }
    }
}

/// Cached alongside a snapshot so the service can classify fresh/expired
/// without re-deriving from `Snapshot::generated_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub snapshot: Snapshot,
    pub ttl: Duration,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(snapshot: Snapshot, ttl: Duration, inserted_at: Instant) -> Self {
        Self {
            snapshot,
            ttl,
            inserted_at,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

/// Options accepted by `SnapshotService::build`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub bypass_cache: bool,
    pub manual_refresh: bool,
}

/// Per-resource allow map handed to `requireAny` domain builders so they can
/// wire only the listers they are permitted to use.
pub type PermissionMap = HashMap<String, bool>;
