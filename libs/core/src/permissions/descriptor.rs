//! Permission descriptors and their canonicalization.

use serde::{Deserialize, Serialize};

/// A single "may I do X" question, in its raw (as-requested) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionDescriptor {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl PermissionDescriptor {
    pub fn new(verb: impl Into<String>, group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            group: group.into(),
            resource: resource.into(),
            subresource: None,
            namespace: None,
            name: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }

    /// Canonicalizes this descriptor: trim whitespace, lowercase
    /// verb/group/resource, normalize empty group to `core`, drop empty
    /// name/namespace/subresource. Idempotent: `canonicalize(canonicalize(d)) == canonicalize(d)`.
    pub fn canonicalize(&self) -> PermissionDescriptor {
        let normalize_group = |g: &str| {
            let trimmed = g.trim().to_lowercase();
            if trimmed.is_empty() {
                "core".to_string()
            } else {
                trimmed
            }
        };
        let normalize_opt = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        PermissionDescriptor {
            verb: self.verb.trim().to_lowercase(),
            group: normalize_group(&self.group),
            resource: self.resource.trim().to_lowercase(),
            subresource: normalize_opt(&self.subresource),
            namespace: normalize_opt(&self.namespace),
            name: normalize_opt(&self.name),
        }
    }

    /// Cache key for this descriptor, assumed already canonical.
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.verb,
            self.group,
            self.resource,
            self.subresource.as_deref().unwrap_or(""),
            self.namespace.as_deref().unwrap_or(""),
            self.name.as_deref().unwrap_or(""),
        )
    }
}
