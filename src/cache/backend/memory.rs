//! In-process LRU backend.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::domain::BackendError;

use super::CacheStoreBackend;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend::memory";
const METRIC_EVICT_TOTAL: &str = "cachet_fragment_evict_total";

/// Stored fragment.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Capacity-bounded LRU store local to one process.
pub struct MemoryBackend {
    entries: RwLock<LruCache<String, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Entry metadata without touching recency.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "peek").peek(key).cloned()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        rw_read(&self.entries, SOURCE, "capacity").cap().get()
    }
}

#[async_trait]
impl CacheStoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = OffsetDateTime::now_utc();
                return Ok(Some(entry.payload.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let now = OffsetDateTime::now_utc();
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            created_at: now,
            last_accessed_at: now,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let displaced = rw_write(&self.entries, SOURCE, "put").push(key.to_string(), entry);
        if let Some((displaced_key, _)) = displaced
            && displaced_key != key
        {
            counter!(METRIC_EVICT_TOTAL, "backend" => "memory").increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(rw_write(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_prefix");
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        Ok(matching.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(capacity: usize) -> MemoryBackend {
        MemoryBackend::new(NonZeroUsize::new(capacity).expect("non-zero"))
    }

    #[tokio::test]
    async fn put_then_get_returns_exact_bytes() {
        let backend = backend(4);
        backend
            .put("views/a", Bytes::from_static(b"<p>a</p>"), None)
            .await
            .expect("put");
        let value = backend.get("views/a").await.expect("get");
        assert_eq!(value, Some(Bytes::from_static(b"<p>a</p>")));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let backend = backend(2);
        backend.put("a", Bytes::from_static(b"1"), None).await.expect("put");
        backend.put("b", Bytes::from_static(b"2"), None).await.expect("put");
        // Touch "a" so "b" becomes the eviction candidate.
        backend.get("a").await.expect("get");
        backend.put("c", Bytes::from_static(b"3"), None).await.expect("put");

        assert!(backend.get("a").await.expect("get").is_some());
        assert!(backend.get("b").await.expect("get").is_none());
        assert!(backend.get("c").await.expect("get").is_some());
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.capacity(), 2);
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() {
        let backend = backend(2);
        backend.put("a", Bytes::from_static(b"old"), None).await.expect("put");
        backend.put("a", Bytes::from_static(b"new"), None).await.expect("put");
        assert_eq!(
            backend.get("a").await.expect("get"),
            Some(Bytes::from_static(b"new"))
        );
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let backend = backend(4);
        backend
            .put("a", Bytes::from_static(b"1"), Some(Duration::from_secs(5)))
            .await
            .expect("put");
        assert!(backend.get("a").await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("a").await.expect("get").is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn get_updates_last_accessed_at() {
        let backend = backend(4);
        backend.put("a", Bytes::from_static(b"1"), None).await.expect("put");
        let before = backend.peek("a").expect("entry");
        backend.get("a").await.expect("get");
        let after = backend.peek("a").expect("entry");
        assert!(after.last_accessed_at >= before.last_accessed_at);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.key, "a");
    }

    #[tokio::test]
    async fn delete_and_delete_prefix() {
        let backend = backend(8);
        for key in ["views/company/1", "views/company/2", "views/employee/7"] {
            backend.put(key, Bytes::from_static(b"x"), None).await.expect("put");
        }

        assert!(backend.delete("views/employee/7").await.expect("delete"));
        assert!(!backend.delete("views/employee/7").await.expect("delete"));

        let removed = backend.delete_prefix("views/company/").await.expect("delete_prefix");
        assert_eq!(removed, 2);
        assert!(backend.is_empty());
    }
}
