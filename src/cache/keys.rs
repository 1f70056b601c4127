//! Cache key derivation.
//!
//! A `CacheKey` is an immutable value naming one piece of content:
//! `namespace/kind/id-<own>.<generation>/<context>`. Any mutation of the
//! resource (its own token) or any propagated touch (its generation) yields a
//! different key, so stale entries simply become unreachable.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::domain::{CacheError, Cacheable, ResourceId};

use super::deps;
use super::versions::VersionRegistry;

const ANONYMOUS_DISCRIMINATOR: &str = "anon";
const CONTEXT_DIGEST_LEN: usize = 16;
const COLLECTION_DIGEST_LEN: usize = 16;

/// Immutable, fully rendered cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    rendered: String,
    namespace_len: usize,
}

impl CacheKey {
    fn new(namespace: &str, rest: &str) -> Self {
        Self {
            rendered: format!("{namespace}/{rest}"),
            namespace_len: namespace.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn namespace(&self) -> &str {
        &self.rendered[..self.namespace_len]
    }

    /// True when this key lives under `prefix` (as used by prefix deletes).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.rendered.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Request-scoped context folded into keys (e.g. the acting principal).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyContext {
    parts: Vec<String>,
}

impl KeyContext {
    /// No context: maps to the canonical `anon` discriminator.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn viewer(principal: impl Into<String>) -> Self {
        Self::new([principal.into()])
    }

    pub fn is_anonymous(&self) -> bool {
        self.parts.is_empty()
    }

    /// Key segment for this context. Supplied contexts are always hashed, so
    /// no principal can render as `anon`.
    pub fn discriminator(&self) -> String {
        if self.parts.is_empty() {
            return ANONYMOUS_DISCRIMINATOR.to_string();
        }
        let mut hasher = Sha256::new();
        for part in &self.parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        format!("ctx-{}", &digest[..CONTEXT_DIGEST_LEN])
    }
}

/// Derives version-sensitive keys for resources and collections.
#[derive(Clone)]
pub struct KeyGenerator {
    namespace: String,
    versions: Arc<VersionRegistry>,
}

impl KeyGenerator {
    pub fn new(namespace: impl Into<String>, versions: Arc<VersionRegistry>) -> Self {
        Self {
            namespace: namespace.into(),
            versions,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn versions(&self) -> &Arc<VersionRegistry> {
        &self.versions
    }

    /// Key for a single resource.
    pub fn key_for(
        &self,
        resource: &dyn Cacheable,
        context: &KeyContext,
    ) -> Result<CacheKey, CacheError> {
        let id = identity_of(resource)?;
        let generation = self.versions.current(&id).generation;
        deps::record(&id, generation);

        Ok(CacheKey::new(
            &self.namespace,
            &format!(
                "{}/{}-{}.{}/{}",
                escape_segment(id.kind()),
                escape_segment(id.id()),
                resource.version_token(),
                generation,
                context.discriminator()
            ),
        ))
    }

    /// Key for a collection of resources of one kind.
    ///
    /// Sensitive to the member set, to each member's version, and to the
    /// maximum version across members, so adding, removing or mutating any
    /// member changes the key. Member order does not matter.
    pub fn key_for_collection(
        &self,
        kind: &str,
        members: &[&dyn Cacheable],
        context: &KeyContext,
    ) -> Result<CacheKey, CacheError> {
        let mut versions = Vec::with_capacity(members.len());
        for member in members {
            let id = identity_of(*member)?;
            let generation = self.versions.current(&id).generation;
            deps::record(&id, generation);
            versions.push((id, member.version_token(), generation));
        }
        versions.sort_by(|a, b| a.0.cmp(&b.0));
        versions.dedup_by(|a, b| a.0 == b.0);

        let max_own = versions.iter().map(|(_, own, _)| *own).max().unwrap_or(0);
        let max_generation = versions.iter().map(|(_, _, g)| *g).max().unwrap_or(0);

        let mut hasher = Sha256::new();
        for (id, own, generation) in &versions {
            hasher.update(id.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(own.to_be_bytes());
            hasher.update(generation.to_be_bytes());
        }
        let digest = hex::encode(hasher.finalize());

        Ok(CacheKey::new(
            &self.namespace,
            &format!(
                "{}/collection-{}-{}.{}-{}/{}",
                escape_segment(kind),
                versions.len(),
                max_own,
                max_generation,
                &digest[..COLLECTION_DIGEST_LEN],
                context.discriminator()
            ),
        ))
    }

    /// Derive a sub-fragment key (e.g. a named section of a page).
    pub fn extend(&self, key: &CacheKey, discriminator: &str) -> CacheKey {
        CacheKey {
            rendered: format!("{}/{}", key.rendered, escape_segment(discriminator)),
            namespace_len: key.namespace_len,
        }
    }

    /// Prefix covering every key generated for resources of `kind`.
    pub fn kind_prefix(&self, kind: &str) -> String {
        format!("{}/{}/", self.namespace, escape_segment(kind))
    }
}

fn identity_of(resource: &dyn Cacheable) -> Result<ResourceId, CacheError> {
    resource
        .identity()
        .ok_or_else(|| CacheError::invalid_resource("identity() returned none"))
}

fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}
