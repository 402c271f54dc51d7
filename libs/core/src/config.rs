//! Injected configuration and clock, replacing a "globals for poll
//! interval / timeout" pattern. Every tunable the refresh subsystem needs
//! lives here with its default value; tests construct a [`RefreshConfig`]
//! with shorter durations and a [`ManualClock`] instead of poking
//! process-global state.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Abstracts wall-clock and monotonic time so tests can control staleness
/// arithmetic deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

use std::fmt;

/// Production clock backed by the real OS clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: starts at an arbitrary epoch and only
/// advances when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
    monotonic_base: Instant,
    elapsed: Duration,
    utc_base: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(utc_base: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualClockState {
                monotonic_base: Instant::now(),
                elapsed: Duration::ZERO,
                utc_base,
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().expect("manual clock mutex poisoned");
        state.elapsed += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().expect("manual clock mutex poisoned");
        state.monotonic_base + state.elapsed
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let state = self.inner.lock().expect("manual clock mutex poisoned");
        state.utc_base + chrono::Duration::from_std(state.elapsed).unwrap_or_default()
    }
}

/// Per-domain-category snapshot cache TTL defaults.
#[derive(Debug, Clone, Copy)]
pub struct CategoryTtls {
    pub system: Duration,
    pub cluster: Duration,
    pub namespace: Duration,
    pub object: Duration,
}

impl Default for CategoryTtls {
    fn default() -> Self {
        Self {
            system: Duration::from_secs(60),
            cluster: Duration::from_secs(15),
            namespace: Duration::from_secs(10),
            object: Duration::from_secs(5),
        }
    }
}

/// Every tunable the refresh subsystem needs, constructed once and threaded
/// into every constructor rather than read from globals.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Permission cache: time an entry is served as `fresh`.
    pub permission_ttl_fresh: Duration,
    /// Permission cache: additional grace window served as `stale` while a
    /// background refresh runs.
    pub permission_ttl_grace: Duration,
    /// SSAR call timeout.
    pub permission_ssar_timeout: Duration,
    /// Wall timeout for the registration pipeline's pre-flight probing.
    pub registration_preflight_timeout: Duration,
    /// Default per-build timeout passed to domain builders.
    pub build_timeout: Duration,
    /// Per-domain-category snapshot TTL defaults.
    pub category_ttls: CategoryTtls,
    /// Ring buffer capacity per stream source.
    pub stream_ring_buffer_size: usize,
    /// Bounded per-subscriber channel capacity.
    pub stream_subscriber_buffer_size: usize,
    /// Max concurrent subscribers per stream source.
    pub stream_max_subscribers: usize,
    /// Manual refresh queue worker pool size.
    pub manual_queue_workers: usize,
    /// Batch chunk size for permission probing.
    pub permission_batch_chunk_size: usize,
    /// Ephemeral debug container poll interval.
    pub ephemeral_debug_poll_interval: Duration,
    /// Ephemeral debug container creation timeout.
    pub ephemeral_debug_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            permission_ttl_fresh: Duration::from_secs(2 * 60),
            permission_ttl_grace: Duration::from_secs(30),
            permission_ssar_timeout: Duration::from_secs(5),
            registration_preflight_timeout: Duration::from_secs(15),
            build_timeout: Duration::from_secs(30),
            category_ttls: CategoryTtls::default(),
            stream_ring_buffer_size: 512,
            stream_subscriber_buffer_size: 64,
            stream_max_subscribers: 64,
            manual_queue_workers: 4,
            permission_batch_chunk_size: 80,
            ephemeral_debug_poll_interval: Duration::from_millis(500),
            ephemeral_debug_timeout: Duration::from_secs(30),
        }
    }
}

impl RefreshConfig {
    /// A config tuned for fast, deterministic unit tests: short timeouts,
    /// small buffers, same relative ordering as the production defaults.
    pub fn for_tests() -> Self {
        Self {
            permission_ttl_fresh: Duration::from_millis(50),
            permission_ttl_grace: Duration::from_millis(20),
            permission_ssar_timeout: Duration::from_millis(200),
            registration_preflight_timeout: Duration::from_millis(500),
            build_timeout: Duration::from_millis(500),
            category_ttls: CategoryTtls {
                system: Duration::from_millis(100),
                cluster: Duration::from_millis(80),
                namespace: Duration::from_millis(60),
                object: Duration::from_millis(40),
            },
            stream_ring_buffer_size: 16,
            stream_subscriber_buffer_size: 4,
            stream_max_subscribers: 4,
            manual_queue_workers: 2,
            permission_batch_chunk_size: 2,
            ephemeral_debug_poll_interval: Duration::from_millis(5),
            ephemeral_debug_timeout: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_advances_when_told_to() {
        let clock = ManualClock::new(Utc::now());
        let first = clock.now();
        assert_eq!(clock.now(), first);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), first + Duration::from_secs(5));
    }

    #[test]
    fn manual_clock_utc_now_tracks_advance() {
        let base = Utc::now();
        let clock = ManualClock::new(base);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.utc_now(), base + chrono::Duration::seconds(30));
    }

    #[test]
    fn for_tests_uses_shorter_durations_than_defaults() {
        let default = RefreshConfig::default();
        let fast = RefreshConfig::for_tests();
        assert!(fast.permission_ttl_fresh < default.permission_ttl_fresh);
        assert!(fast.build_timeout < default.build_timeout);
        assert!(fast.stream_ring_buffer_size < default.stream_ring_buffer_size);
    }
}
