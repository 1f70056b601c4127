//! Pluggable fragment storage.
//!
//! Backends deal in raw string keys and byte payloads; `FragmentCacheStore`
//! adds key typing, timeouts and fail-open behavior on top.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::domain::BackendError;

use super::config::{BackendKind, CacheConfig};

pub use self::memory::{CacheEntry, MemoryBackend};
pub use self::redis::RedisBackend;

/// Storage capability shared by the in-process and distributed stores.
///
/// A `put` must be atomic with respect to concurrent `get`s on the same key:
/// readers observe either the previous payload or the new one.
#[async_trait]
pub trait CacheStoreBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Store `payload`; `ttl` of `None` keeps it until evicted.
    async fn put(&self, key: &str, payload: Bytes, ttl: Option<Duration>)
    -> Result<(), BackendError>;

    /// Returns true if an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove every key starting with `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError>;
}

/// Build the backend selected by configuration.
pub async fn build_backend(
    config: &CacheConfig,
) -> Result<Arc<dyn CacheStoreBackend>, BackendError> {
    match &config.backend {
        BackendKind::Memory => {
            info!(
                capacity = config.memory_capacity,
                "Using in-process fragment store; entries are not shared between processes"
            );
            Ok(Arc::new(MemoryBackend::new(config.memory_capacity_non_zero())))
        }
        BackendKind::Redis { url } => {
            let backend = RedisBackend::connect(url, &config.key_prefix).await?;
            info!(key_prefix = %config.key_prefix, "Using redis fragment store");
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_is_built_by_default() {
        let config = CacheConfig::default();
        let backend = build_backend(&config).await.expect("memory backend");
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn invalid_redis_url_is_rejected() {
        let config = CacheConfig {
            backend: BackendKind::Redis {
                url: "not a url".to_string(),
            },
            ..CacheConfig::default()
        };
        assert!(build_backend(&config).await.is_err());
    }
}
