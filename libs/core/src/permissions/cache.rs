//! Permission cache entries and their `absent -> fresh -> stale -> expired`
//! state machine.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::Clock;

/// Outcome of a single permission evaluation, cached per canonical
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub denied_reason: Option<String>,
    pub evaluation_error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Fresh,
    Cache,
    Stale,
    Fallback,
}

impl PermissionDecision {
    pub fn allowed(source: DecisionSource, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            denied_reason: None,
            evaluation_error: None,
            evaluated_at,
            source,
        }
    }

    pub fn denied(reason: impl Into<String>, source: DecisionSource, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            denied_reason: Some(reason.into()),
            evaluation_error: None,
            evaluated_at,
            source,
        }
    }

    pub fn error(message: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            denied_reason: None,
            evaluation_error: Some(message.into()),
            evaluated_at,
            source: DecisionSource::Fallback,
        }
    }

    fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = source;
        self
    }
}

/// What stage of its life a cache entry is in relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub decision: PermissionDecision,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(decision: PermissionDecision, inserted_at: Instant) -> Self {
        Self {
            decision,
            inserted_at,
        }
    }

    /// Classifies this entry's state given the fresh TTL and grace window.
    pub fn state(&self, clock: &dyn Clock, ttl_fresh: Duration, grace: Duration) -> EntryState {
        let age = clock.now().saturating_duration_since(self.inserted_at);
        if age <= ttl_fresh {
            EntryState::Fresh
        } else if age <= ttl_fresh + grace {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }

    /// A copy of the decision tagged with the given source, for returning
    /// to a caller without mutating the stored entry.
    pub fn decision_as(&self, source: DecisionSource) -> PermissionDecision {
        self.decision.clone().with_source(source)
    }
}
