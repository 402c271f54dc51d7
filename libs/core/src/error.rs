//! Error taxonomy for the refresh subsystem.
//!
//! Every variant maps to one of the four families an external transport is
//! expected to translate into an HTTP status: client error, authorization,
//! transient (retryable), or fatal. The core never depends on an HTTP
//! framework to do that translation itself — `http_status_hint` is a plain
//! `u16` a caller can use however it likes.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A request did not carry a cluster identifier where one is required.
    #[error("missing cluster identifier")]
    MissingClusterScope,

    /// A scope string failed to parse (e.g. empty namespace/kind segment).
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// No domain is registered under the requested name.
    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    /// The requested cluster id is not currently routed by the aggregator.
    #[error("cluster not active: {0}")]
    ClusterNotActive(String),

    /// An object-scoped request named an object that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A domain, or a specific resource a domain needed, was denied by RBAC.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An external call (SSAR, list/watch/get) did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The Kubernetes API server responded with a rate-limit signal.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A transport-level failure talking to the API server.
    #[error("network error: {0}")]
    Network(String),

    /// A stream subscriber limit was reached.
    #[error("subscriber limit reached")]
    SubscriberLimit,

    /// Any error surfaced directly by `kube`.
    #[error("kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    /// A condition the core's own invariants should have prevented.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Any other unexpected, non-retryable failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The current tracing span has no valid OpenTelemetry trace id to
    /// attach as a metrics exemplar.
    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Whether a caller may usefully retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::RateLimited(_) | Error::Network(_) | Error::SubscriberLimit
        )
    }

    /// Status code an HTTP transport would plausibly map this to.
    pub fn http_status_hint(&self) -> u16 {
        match self {
            Error::MissingClusterScope | Error::InvalidScope(_) => 400,
            Error::PermissionDenied(_) => 403,
            Error::UnknownDomain(_) | Error::ClusterNotActive(_) | Error::NotFound(_) => 404,
            Error::SubscriberLimit => 429,
            Error::Timeout(_) | Error::RateLimited(_) | Error::Network(_) => 503,
            Error::Kube(_) | Error::InvariantViolation(_) | Error::Internal(_) | Error::InvalidTraceId => 500,
        }
    }

    /// A lossy clone used only to fan a singleflight-coalesced build result
    /// out to multiple awaiters: `kube::Error` itself is not `Clone`, so the
    /// `Kube` variant is downgraded to `Network` carrying its message. Every
    /// other variant clones exactly.
    pub fn fanout_clone(&self) -> Error {
        match self {
            Error::MissingClusterScope => Error::MissingClusterScope,
            Error::InvalidScope(s) => Error::InvalidScope(s.clone()),
            Error::UnknownDomain(s) => Error::UnknownDomain(s.clone()),
            Error::ClusterNotActive(s) => Error::ClusterNotActive(s.clone()),
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::PermissionDenied(s) => Error::PermissionDenied(s.clone()),
            Error::Timeout(s) => Error::Timeout(s.clone()),
            Error::RateLimited(s) => Error::RateLimited(s.clone()),
            Error::Network(s) => Error::Network(s.clone()),
            Error::SubscriberLimit => Error::SubscriberLimit,
            Error::Kube(e) => Error::Network(e.to_string()),
            Error::InvariantViolation(s) => Error::InvariantViolation(s.clone()),
            Error::Internal(s) => Error::Internal(s.clone()),
            Error::InvalidTraceId => Error::InvalidTraceId,
        }
    }

    /// Classifies a `kube::Error` into the transient/permanent buckets the
    /// permission checker's fallback logic needs.
    pub fn classify_kube(err: &kube::Error) -> KubeErrorClass {
        match err {
            kube::Error::Api(resp) => match resp.code {
                429 => KubeErrorClass::Transient,
                500..=599 => KubeErrorClass::Transient,
                403 => KubeErrorClass::PermanentDenied,
                404 => KubeErrorClass::PermanentDenied,
                _ => KubeErrorClass::Permanent,
            },
            kube::Error::HttpError(_) | kube::Error::Service(_) => KubeErrorClass::Transient,
            _ => KubeErrorClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeErrorClass {
    /// Timeout, rate limit, network blip — safe to fall back to stale cache.
    Transient,
    /// The server told us plainly the identity is denied / resource is gone.
    PermanentDenied,
    /// Some other permanent failure (malformed request, etc).
    Permanent,
}

impl fmt::Display for KubeErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KubeErrorClass::Transient => write!(f, "transient"),
            KubeErrorClass::PermanentDenied => write!(f, "permanent-denied"),
            KubeErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}
