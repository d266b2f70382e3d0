//! In-process cache backend.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, instrument};

use super::{Cache, CacheError, decode_value, encode_value};

/// Cache backed by a concurrent hash map. Entries live as long as the value.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Vec<u8>>,
    compressed: bool,
}

impl MemoryCache {
    /// Creates an empty, uncompressed memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn init(&self) -> Result<(), CacheError> {
        debug!(compressed = self.compressed, "memory cache ready");
        Ok(())
    }

    async fn is_cached(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let stored = self.entries.get(key).map(|entry| entry.value().clone());
        stored
            .map(|value| decode_value(value, self.compressed))
            .transpose()
    }

    #[instrument(level = "trace", skip(self, value), fields(bytes = value.len()))]
    async fn cache(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        // Encode outside the shard lock; the entry API then makes check+insert atomic.
        let encoded = encode_value(value, self.compressed)?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => debug!(key, "cache entry exists, keeping first write"),
            Entry::Vacant(slot) => {
                slot.insert(encoded);
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn set_compression(&mut self, compressed: bool) {
        self.compressed = compressed;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_first_write_wins() {
        let cache = MemoryCache::new();
        cache.init().await.unwrap();
        cache.cache("k", b"v1").await.unwrap();
        cache.cache("k", b"v2").await.unwrap();
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_compression_is_transparent() {
        let mut cache = MemoryCache::new();
        cache.set_compression(true);
        cache.init().await.unwrap();
        let value = b"hello hello hello hello hello".to_vec();
        cache.cache("k", &value).await.unwrap();
        assert_ne!(cache.entries.get("k").unwrap().value(), &value);
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_clear_keeps_store_usable() {
        let cache = MemoryCache::new();
        cache.cache("k", b"v").await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_cached("k").await.unwrap().is_none());
        cache.cache("k", b"w").await.unwrap();
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(b"w".to_vec()));
    }

    #[tokio::test]
    async fn test_racing_writers_leave_one_entry() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.cache("same", &[i]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.is_cached("same").await.unwrap().unwrap().len(), 1);
    }
}
