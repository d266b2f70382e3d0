//! SQLite cache backend.
//!
//! Records live in one table, `"predator-cache"`, with the fingerprint as
//! primary key. Inserts use `ON CONFLICT(key) DO NOTHING` so two workers that
//! both missed the cache cannot create duplicate rows and the first write wins.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::{Cache, CacheError, decode_value, encode_value};
use crate::db::Database;

/// Name of the cache table.
pub const CACHE_TABLE: &str = "predator-cache";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
    Existing(Database),
}

/// Cache persisted in a SQLite database.
///
/// The connection is opened lazily by [`Cache::init`], so an unreachable path
/// is reported from there rather than from the constructor.
#[derive(Debug)]
pub struct SqliteCache {
    location: Location,
    db: OnceCell<Database>,
    compressed: bool,
}

impl SqliteCache {
    /// Cache stored in the database file at `path` (created if missing).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::at(Location::File(path.into()))
    }

    /// Cache stored in a private in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::at(Location::Memory)
    }

    /// Cache stored in an already-open database.
    #[must_use]
    pub fn with_database(db: Database) -> Self {
        Self::at(Location::Existing(db))
    }

    fn at(location: Location) -> Self {
        Self {
            location,
            db: OnceCell::new(),
            compressed: false,
        }
    }

    fn db(&self) -> Result<&Database, CacheError> {
        self.db.get().ok_or(CacheError::NotInitialized)
    }

    async fn open(&self) -> Result<Database, CacheError> {
        let db = match &self.location {
            Location::File(path) => Database::new(path).await?,
            Location::Memory => Database::new_in_memory().await?,
            Location::Existing(db) => db.clone(),
        };
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{CACHE_TABLE}\" (key TEXT PRIMARY KEY, value BLOB)"
        ))
        .execute(db.pool())
        .await?;
        Ok(db)
    }
}

#[async_trait]
impl Cache for SqliteCache {
    #[instrument(skip(self), fields(location = ?self.location, compressed = self.compressed))]
    async fn init(&self) -> Result<(), CacheError> {
        self.db.get_or_try_init(|| self.open()).await?;
        debug!("sqlite cache ready");
        Ok(())
    }

    async fn is_cached(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as(&format!("SELECT value FROM \"{CACHE_TABLE}\" WHERE key = ?"))
                .bind(key)
                .fetch_optional(self.db()?.pool())
                .await?;
        row.map(|(value,)| decode_value(value, self.compressed))
            .transpose()
    }

    #[instrument(level = "trace", skip(self, value), fields(bytes = value.len()))]
    async fn cache(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let encoded = encode_value(value, self.compressed)?;
        let result = sqlx::query(&format!(
            "INSERT INTO \"{CACHE_TABLE}\" (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING"
        ))
        .bind(key)
        .bind(encoded)
        .execute(self.db()?.pool())
        .await?;
        if result.rows_affected() == 0 {
            debug!(key, "cache entry exists, keeping first write");
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        sqlx::query(&format!("DELETE FROM \"{CACHE_TABLE}\""))
            .execute(self.db()?.pool())
            .await?;
        Ok(())
    }

    fn set_compression(&mut self, compressed: bool) {
        self.compressed = compressed;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_use_before_init_fails() {
        let cache = SqliteCache::in_memory();
        assert!(matches!(
            cache.is_cached("k").await,
            Err(CacheError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let cache = SqliteCache::in_memory();
        cache.init().await.unwrap();
        cache.cache("k", b"first").await.unwrap();
        cache.cache("k", b"second").await.unwrap();
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_compressed_values_are_stored_as_zlib() {
        let mut cache = SqliteCache::in_memory();
        cache.set_compression(true);
        cache.init().await.unwrap();
        let value = b"abcabcabcabcabcabcabcabc".to_vec();
        cache.cache("k", &value).await.unwrap();

        let (stored,): (Vec<u8>,) =
            sqlx::query_as(&format!("SELECT value FROM \"{CACHE_TABLE}\" WHERE key = 'k'"))
                .fetch_one(cache.db().unwrap().pool())
                .await
                .unwrap();
        assert_ne!(stored, value);
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_clear_then_reuse() {
        let cache = SqliteCache::in_memory();
        cache.init().await.unwrap();
        cache.cache("k", b"v").await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_cached("k").await.unwrap().is_none());
        cache.cache("k", b"w").await.unwrap();
        assert_eq!(cache.is_cached("k").await.unwrap(), Some(b"w".to_vec()));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let cache = SqliteCache::in_memory();
        cache.init().await.unwrap();
        cache.cache("k", b"v").await.unwrap();
        cache.init().await.unwrap();
        assert!(cache.is_cached("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_init_reports_unopenable_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = SqliteCache::new(temp_dir.path().join("missing").join("c.db"));
        assert!(matches!(cache.init().await, Err(CacheError::Open(_))));
    }
}
