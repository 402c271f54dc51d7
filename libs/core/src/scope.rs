//! `ClusterId`, `DomainName`, and the parsed `Scope` variant type. The wire
//! format stays a plain string for compatibility; the aggregator parses it
//! into a [`Scope`] exactly once at its boundary and everything inward
//! matches on the variant instead of re-parsing strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Opaque stable identifier of the form `<source>:<context>`. Equality is
/// byte-exact after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Category a domain belongs to, used for default cache TTL selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainCategory {
    System,
    Cluster,
    Namespace,
    Object,
}

/// Short lower-kebab-case domain name. Kept as a thin newtype
/// over `String` rather than a closed enum: the registry is the source of
/// truth for which names are actually registered, and new domains should
/// not require a core-crate release to add.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DomainName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Parsed scope: the wire format is always a plain string, parsed once at
/// the aggregator boundary. Everything inward matches on this variant
/// instead of re-parsing the raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Empty,
    Namespace(String),
    Object {
        kind: String,
        namespace: String,
        name: String,
    },
    /// Only ever produced by the aggregator parsing a `clusters=a,b|inner`
    /// prefix; a per-cluster subsystem never sees this variant itself, it
    /// only ever sees the `inner` scope that rides behind it.
    Clusters {
        ids: Vec<ClusterId>,
        inner: Box<Scope>,
    },
}

impl Scope {
    /// Parses the wire format. An object scope with an empty kind
    /// (`object::ns:name`) is rejected as `InvalidScope` rather than
    /// falling back to a generic payload.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Ok(Scope::Empty);
        }

        if let Some(rest) = raw.strip_prefix("clusters=") {
            let (ids_part, inner_part) = rest
                .split_once('|')
                .ok_or_else(|| Error::InvalidScope(raw.to_string()))?;
            if ids_part.is_empty() {
                return Err(Error::InvalidScope(raw.to_string()));
            }
            let ids = ids_part
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(ClusterId::new)
                .collect::<Vec<_>>();
            if ids.is_empty() {
                return Err(Error::InvalidScope(raw.to_string()));
            }
            let inner = Scope::parse(inner_part)?;
            return Ok(Scope::Clusters {
                ids,
                inner: Box::new(inner),
            });
        }

        if let Some(rest) = raw.strip_prefix("namespace:") {
            if rest.is_empty() {
                return Err(Error::InvalidScope(raw.to_string()));
            }
            return Ok(Scope::Namespace(rest.to_string()));
        }

        if let Some(rest) = raw.strip_prefix("object:") {
            let mut parts = rest.splitn(3, ':');
            let kind = parts.next().unwrap_or("");
            let namespace = parts.next().unwrap_or("");
            let name = parts.next().unwrap_or("");
            if kind.is_empty() || name.is_empty() {
                return Err(Error::InvalidScope(raw.to_string()));
            }
            return Ok(Scope::Object {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        Err(Error::InvalidScope(raw.to_string()))
    }

    /// The inner scope, stripping any `Clusters` prefix. Per-cluster
    /// subsystems only ever operate on this.
    pub fn into_inner(self) -> Scope {
        match self {
            Scope::Clusters { inner, .. } => inner.into_inner(),
            other => other,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Empty => Ok(()),
            Scope::Namespace(ns) => write!(f, "namespace:{ns}"),
            Scope::Object {
                kind,
                namespace,
                name,
            } => write!(f, "object:{kind}:{namespace}:{name}"),
            Scope::Clusters { ids, inner } => {
                let joined = ids
                    .iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "clusters={joined}|{inner}")
            }
        }
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scope_parses() {
        assert_eq!(Scope::parse("").unwrap(), Scope::Empty);
    }

    #[test]
    fn namespace_scope_parses() {
        assert_eq!(
            Scope::parse("namespace:team-a").unwrap(),
            Scope::Namespace("team-a".into())
        );
    }

    #[test]
    fn namespace_scope_rejects_empty_name() {
        assert!(Scope::parse("namespace:").is_err());
    }

    #[test]
    fn object_scope_parses() {
        assert_eq!(
            Scope::parse("object:Pod:team-a:web-0").unwrap(),
            Scope::Object {
                kind: "Pod".into(),
                namespace: "team-a".into(),
                name: "web-0".into(),
            }
        );
    }

    #[test]
    fn object_scope_rejects_empty_kind() {
        assert!(Scope::parse("object::team-a:web-0").is_err());
    }

    #[test]
    fn object_scope_rejects_empty_name() {
        assert!(Scope::parse("object:Pod:team-a:").is_err());
    }

    #[test]
    fn clusters_prefix_parses_and_strips() {
        let scope = Scope::parse("clusters=a:ctx1,b:ctx2|namespace:team-a").unwrap();
        match &scope {
            Scope::Clusters { ids, inner } => {
                assert_eq!(ids, &vec![ClusterId::new("a:ctx1"), ClusterId::new("b:ctx2")]);
                assert_eq!(**inner, Scope::Namespace("team-a".into()));
            }
            _ => panic!("expected Clusters variant"),
        }
        assert_eq!(scope.into_inner(), Scope::Namespace("team-a".into()));
    }

    #[test]
    fn clusters_prefix_requires_at_least_one_id() {
        assert!(Scope::parse("clusters=|namespace:team-a").is_err());
    }

    #[test]
    fn cluster_id_equality_is_exact_after_trim() {
        assert_eq!(ClusterId::new("  prod:east "), ClusterId::new("prod:east"));
        assert_ne!(ClusterId::new("Prod:east"), ClusterId::new("prod:east"));
    }

    #[test]
    fn display_roundtrips_for_non_clusters_variants() {
        let ns = Scope::Namespace("team-a".into());
        assert_eq!(ns.to_string(), "namespace:team-a");
        assert_eq!(Scope::parse(&ns.to_string()).unwrap(), ns);

        let obj = Scope::Object {
            kind: "Pod".into(),
            namespace: "team-a".into(),
            name: "web-0".into(),
        };
        assert_eq!(obj.to_string(), "object:Pod:team-a:web-0");
        assert_eq!(Scope::parse(&obj.to_string()).unwrap(), obj);
    }
}
