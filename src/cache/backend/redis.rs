//! Shared redis backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::domain::BackendError;

use super::CacheStoreBackend;

const SCAN_BATCH: usize = 500;

/// Fragment store shared by every serving process.
///
/// Keys are namespaced with `key_prefix` so several deployments can share an
/// instance.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisBackend {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(key_prefix, "Redis connection manager ready");
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn put(
        &self,
        key: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let full_key = self.full_key(key);
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(full_key, payload.as_ref(), ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(full_key, payload.as_ref()).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(self.full_key(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let pattern = scan_pattern(&self.full_key(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let count: usize = conn.del(&keys).await?;
                removed += count;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern, removed, "Redis prefix delete complete");
        Ok(removed)
    }
}

/// `SCAN MATCH` pattern matching every key that starts with `prefix`.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('*');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pattern_escapes_glob_characters() {
        assert_eq!(scan_pattern("cachet:views/"), "cachet:views/*");
        assert_eq!(scan_pattern("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\*");
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let result = RedisBackend::connect("definitely not redis", "cachet:").await;
        assert!(result.is_err());
    }
}
