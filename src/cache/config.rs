//! Cache configuration.
//!
//! Resolved from the `[cache]`, `[page_cache]` and `[http]` sections of
//! `cachet.toml` (see `crate::config`).

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::conditional::CachePolicy;

const DEFAULT_NAMESPACE: &str = "views";
const DEFAULT_KEY_PREFIX: &str = "cachet:";
const DEFAULT_MEMORY_CAPACITY: usize = 1024;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_PAGE_ROOT: &str = "public/cache";
const DEFAULT_GZIP_MIN_BYTES: usize = 256;
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Which fragment store backend to build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process LRU. Not shared between server processes.
    Memory,
    /// Shared Redis instance, required for horizontally scaled deployments.
    Redis { url: String },
}

/// Runtime cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every generated cache key.
    pub namespace: String,
    /// Enable the fragment store. When disabled every lookup is a miss.
    pub enable_fragment_cache: bool,
    /// Enable page artifact materialization.
    pub enable_page_cache: bool,
    /// Fragment store backend.
    pub backend: BackendKind,
    /// Prefix applied to keys inside a shared backend.
    pub key_prefix: String,
    /// Maximum entries held by the in-process backend.
    pub memory_capacity: usize,
    /// Optional expiry for fragments; `None` keeps them until evicted.
    pub fragment_ttl_seconds: Option<u64>,
    /// Upper bound on a single backend round-trip.
    pub store_timeout_ms: u64,
    /// Root directory for page artifacts.
    pub page_root: PathBuf,
    /// Write a `.gz` sibling next to each artifact.
    pub gzip_artifacts: bool,
    /// Bodies smaller than this are not compressed.
    pub gzip_min_bytes: usize,
    /// Largest response body the page-cache middleware will buffer.
    pub max_body_bytes: usize,
    /// Default `Cache-Control` policy for conditional responses.
    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            enable_fragment_cache: true,
            enable_page_cache: true,
            backend: BackendKind::Memory,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            fragment_ttl_seconds: None,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            page_root: PathBuf::from(DEFAULT_PAGE_ROOT),
            gzip_artifacts: true,
            gzip_min_bytes: DEFAULT_GZIP_MIN_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            policy: CachePolicy::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let cache = &settings.cache;
        let page = &settings.page_cache;
        Self {
            namespace: cache.namespace.clone(),
            enable_fragment_cache: cache.enabled,
            enable_page_cache: page.enabled,
            backend: cache.backend.clone(),
            key_prefix: cache.key_prefix.clone(),
            memory_capacity: cache.memory_capacity.get(),
            fragment_ttl_seconds: cache.fragment_ttl.map(|ttl| ttl.as_secs()),
            store_timeout_ms: u64::try_from(cache.store_timeout.as_millis()).unwrap_or(u64::MAX),
            page_root: page.root.clone(),
            gzip_artifacts: page.gzip,
            gzip_min_bytes: page.gzip_min_bytes,
            max_body_bytes: page.max_body_bytes.get(),
            policy: settings.http.policy(),
        }
    }
}

impl CacheConfig {
    /// Returns true if any cache layer is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enable_fragment_cache || self.enable_page_cache
    }

    /// Memory backend capacity, clamped to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Backend timeout, clamped to 1ms if zero.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn fragment_ttl(&self) -> Option<Duration> {
        self.fragment_ttl_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
