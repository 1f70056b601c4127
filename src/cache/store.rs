//! Fragment cache store.
//!
//! Typed, time-bounded access to a `CacheStoreBackend`. Reads fail open: a
//! backend that is down or slow turns into a miss and the caller renders.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::domain::{BackendError, CacheError};

use super::backend::CacheStoreBackend;
use super::config::CacheConfig;
use super::keys::CacheKey;

const METRIC_HIT_TOTAL: &str = "cachet_fragment_hit_total";
const METRIC_MISS_TOTAL: &str = "cachet_fragment_miss_total";
const METRIC_UNAVAILABLE_TOTAL: &str = "cachet_fragment_unavailable_total";

#[derive(Clone)]
pub struct FragmentCacheStore {
    backend: Arc<dyn CacheStoreBackend>,
    timeout: Duration,
    ttl: Option<Duration>,
    enabled: bool,
}

impl FragmentCacheStore {
    pub fn new(backend: Arc<dyn CacheStoreBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            timeout: config.store_timeout(),
            ttl: config.fragment_ttl(),
            enabled: config.enable_fragment_cache,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lookup that reports backend failures.
    pub async fn try_get(&self, key: &CacheKey) -> Result<Option<Bytes>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let value = self
            .bounded("get", self.backend.get(key.as_str()))
            .await?;

        let outcome = if value.is_some() { "hit" } else { "miss" };
        counter!(
            if value.is_some() { METRIC_HIT_TOTAL } else { METRIC_MISS_TOTAL },
            "backend" => self.backend.name()
        )
        .increment(1);
        debug!(key = %key, outcome, "Fragment lookup");
        Ok(value)
    }

    /// Lookup that treats an unavailable backend as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(err) => {
                self.fail_open(key, &err);
                None
            }
        }
    }

    /// Store a fragment with the configured TTL.
    pub async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<(), CacheError> {
        self.put_with_ttl(key, payload, self.ttl).await
    }

    pub async fn put_with_ttl(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }
        self.bounded("put", self.backend.put(key.as_str(), payload, ttl))
            .await
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.bounded("delete", self.backend.delete(key.as_str()))
            .await
    }

    /// Remove every fragment whose key starts with `prefix` (e.g. a whole
    /// namespace or resource kind).
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let removed = self
            .bounded("delete_prefix", self.backend.delete_prefix(prefix))
            .await?;
        debug!(prefix, removed, "Fragment prefix delete");
        Ok(removed)
    }

    /// Return the cached fragment or render, store and return it.
    ///
    /// A failed store after rendering is logged and otherwise ignored; the
    /// rendered bytes are returned either way.
    pub async fn fetch<F, Fut, E>(&self, key: &CacheKey, render: F) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }

        let rendered = render().await?;
        if let Err(err) = self.put(key, rendered.clone()).await {
            warn!(
                key = %key,
                error = %err,
                result = "populate_skipped",
                "Failed to populate fragment cache"
            );
        }
        Ok(rendered)
    }

    async fn bounded<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, CacheError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let backend = self.backend.name();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CacheError::store_unavailable(backend, op, source)),
            Err(_) => Err(CacheError::store_unavailable(
                backend,
                op,
                BackendError::Timeout {
                    op,
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                },
            )),
        }
    }

    fn fail_open(&self, key: &CacheKey, err: &CacheError) {
        counter!(METRIC_UNAVAILABLE_TOTAL, "backend" => self.backend.name()).increment(1);
        warn!(
            key = %key,
            error = %err,
            result = "fail_open",
            "Fragment store unavailable; treating as miss"
        );
    }
}
