//! Fingerprint-keyed response cache.
//!
//! The crawler talks to any [`Cache`] implementation through a trait object.
//! Two backends ship with the crate:
//!
//! - [`MemoryCache`] - process-local, backed by a [`dashmap::DashMap`]
//! - [`SqliteCache`] - the `"predator-cache"` table in a SQLite database
//!
//! Every backend honours the same contract: the first write for a key wins,
//! reads return exactly the bytes that were written (compression is
//! transparent), and `clear()` leaves the store usable.
//!
//! # Example
//!
//! ```
//! use predator::cache::{Cache, MemoryCache};
//!
//! # async fn example() -> Result<(), predator::cache::CacheError> {
//! let mut cache = MemoryCache::new();
//! cache.set_compression(true);
//! cache.init().await?;
//!
//! cache.cache("abc", b"first").await?;
//! cache.cache("abc", b"second").await?;
//! assert_eq!(cache.is_cached("abc").await?, Some(b"first".to_vec()));
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::{CACHE_TABLE, SqliteCache};

use std::io::{Read, Write};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

use crate::db::DbError;

/// Errors raised by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be opened.
    #[error("failed to open cache store: {0}")]
    Open(#[from] DbError),

    /// A query against the backing store failed.
    #[error("cache query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Compressing or decompressing a record failed.
    #[error("cache record compression failed: {0}")]
    Compression(#[from] std::io::Error),

    /// A stored record could not be decoded into a response.
    #[error("cache record is malformed: {0}")]
    Record(#[from] crate::response::RecordError),

    /// The cache was used before `init()`.
    #[error("cache used before init()")]
    NotInitialized,
}

/// A keyed byte store for serialized responses.
///
/// Implementations must be safe to call from many workers at once. Racing
/// `cache()` calls for the same key must collapse to a single entry.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Opens the backing store. Called once by the crawler builder, after
    /// [`set_compression`](Cache::set_compression).
    async fn init(&self) -> Result<(), CacheError>;

    /// Returns the stored bytes for `key`, if any.
    async fn is_cached(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value` under `key` unless an entry already exists.
    async fn cache(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Enables zlib compression of stored values. Must not change after `init()`.
    fn set_compression(&mut self, compressed: bool);
}

/// Compresses `value` with zlib.
pub(crate) fn compress(value: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(value.len() / 2), Compression::default());
    encoder.write_all(value)?;
    Ok(encoder.finish()?)
}

/// Inflates a zlib stream produced by [`compress`].
pub(crate) fn decompress(value: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = ZlibDecoder::new(value);
    let mut out = Vec::with_capacity(value.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Encodes a value for storage according to the compression flag.
pub(crate) fn encode_value(value: &[u8], compressed: bool) -> Result<Vec<u8>, CacheError> {
    if compressed {
        compress(value)
    } else {
        Ok(value.to_vec())
    }
}

/// Decodes a stored value according to the compression flag.
pub(crate) fn decode_value(stored: Vec<u8>, compressed: bool) -> Result<Vec<u8>, CacheError> {
    if compressed {
        decompress(&stored)
    } else {
        Ok(stored)
    }
}
