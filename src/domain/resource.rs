//! Cacheable resources and their identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Stable identity of a cacheable resource, rendered as `kind#id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    kind: String,
    id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid resource id `{input}`: expected `kind#id`")]
pub struct ResourceIdParseError {
    input: String,
}

impl ResourceId {
    /// Build an identity. Returns `None` when either half is blank, which is
    /// how unsaved records without a primary key present themselves.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Option<Self> {
        let kind = kind.into();
        let id = id.into();
        if kind.trim().is_empty() || id.trim().is_empty() || kind.contains('#') {
            return None;
        }
        Some(Self { kind, id })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

impl FromStr for ResourceId {
    type Err = ResourceIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once('#')
            .and_then(|(kind, id)| Self::new(kind, id))
            .ok_or_else(|| ResourceIdParseError {
                input: s.to_string(),
            })
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ResourceIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.to_string()
    }
}

/// Capability implemented by every type that participates in caching.
///
/// `version_token` must advance on every mutation of the resource. Timestamps
/// (e.g. microseconds since the epoch) and counters both work; the key
/// generator only compares tokens for equality.
pub trait Cacheable: Send + Sync {
    fn identity(&self) -> Option<ResourceId>;

    fn version_token(&self) -> u64;

    /// Modification time used for `Last-Modified`.
    fn last_modified(&self) -> Option<OffsetDateTime> {
        None
    }
}

impl<T: Cacheable + ?Sized> Cacheable for &T {
    fn identity(&self) -> Option<ResourceId> {
        (**self).identity()
    }

    fn version_token(&self) -> u64 {
        (**self).version_token()
    }

    fn last_modified(&self) -> Option<OffsetDateTime> {
        (**self).last_modified()
    }
}

/// Plain snapshot of a resource's cache-relevant metadata, as handed over by
/// the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: Option<ResourceId>,
    pub version: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ResourceSnapshot {
    pub fn new(id: ResourceId, version: u64) -> Self {
        Self {
            id: Some(id),
            version,
            updated_at: None,
        }
    }

    /// A record that has not been persisted yet.
    pub fn unsaved() -> Self {
        Self {
            id: None,
            version: 0,
            updated_at: None,
        }
    }

    pub fn with_updated_at(mut self, updated_at: OffsetDateTime) -> Self {
        self.updated_at = Some(updated_at);
        self
    }
}

impl Cacheable for ResourceSnapshot {
    fn identity(&self) -> Option<ResourceId> {
        self.id.clone()
    }

    fn version_token(&self) -> u64 {
        self.version
    }

    fn last_modified(&self) -> Option<OffsetDateTime> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let id: ResourceId = "employee#7".parse().expect("valid id");
        assert_eq!(id.kind(), "employee");
        assert_eq!(id.id(), "7");
        assert_eq!(id.to_string(), "employee#7");
    }

    #[test]
    fn blank_halves_are_rejected() {
        assert!(ResourceId::new("", "1").is_none());
        assert!(ResourceId::new("company", "  ").is_none());
        assert!("company".parse::<ResourceId>().is_err());
        assert!("#1".parse::<ResourceId>().is_err());
    }

    #[test]
    fn id_half_may_contain_separator() {
        let id: ResourceId = "path#/a#b".parse().expect("valid id");
        assert_eq!(id.kind(), "path");
        assert_eq!(id.id(), "/a#b");
    }

    #[test]
    fn unsaved_snapshot_has_no_identity() {
        assert!(ResourceSnapshot::unsaved().identity().is_none());
    }

    #[test]
    fn serde_uses_display_form() {
        let id: ResourceId = "company#1".parse().expect("valid id");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"company#1\"");
        let back: ResourceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
