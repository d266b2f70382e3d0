//! Data-only crawler configuration loadable from JSON.
//!
//! [`CrawlerConfig`] mirrors every [`CrawlerBuilder`](crate::CrawlerBuilder)
//! option that is plain data. Closures (handlers, retry predicates,
//! replenishers) and custom cache backends are still attached in code.
//!
//! ```json
//! {
//!   "user_agent": "my-bot/1.0",
//!   "concurrency": 8,
//!   "block_panic": true,
//!   "retry_count": 3,
//!   "proxies": ["http://10.0.0.1:3128"],
//!   "timeout_ms": 10000,
//!   "cache": { "location": "crawl-cache.db", "compressed": true, "query_fields": ["page"] },
//!   "log": { "level": "debug", "sink": { "kind": "console" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{Cache, MemoryCache, SqliteCache};
use crate::context::ContextKind;
use crate::error::CrawlError;
use crate::fingerprint::CacheField;
use crate::logging::LogConfig;

/// Cache location meaning "keep entries in process memory".
pub const MEMORY_CACHE_LOCATION: &str = "memory";

/// Cache section of a [`CrawlerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// `memory` or the path of a SQLite database file.
    pub location: String,
    /// Store values zlib-compressed.
    #[serde(default)]
    pub compressed: bool,
    /// Query parameters contributing to the fingerprint.
    #[serde(default)]
    pub query_fields: Vec<String>,
    /// Body parameters (dotted paths for JSON) contributing to the fingerprint.
    #[serde(default)]
    pub body_fields: Vec<String>,
}

impl CacheConfig {
    /// Opens the configured backend (not yet initialized).
    #[must_use]
    pub fn backend(&self) -> Box<dyn Cache> {
        open_backend(&self.location)
    }

    /// Fingerprint fields described by this section.
    #[must_use]
    pub fn fields(&self) -> Vec<CacheField> {
        self.query_fields
            .iter()
            .map(CacheField::query)
            .chain(self.body_fields.iter().map(CacheField::body))
            .collect()
    }
}

/// Builds an uninitialized cache for a `memory` or SQLite path location.
#[must_use]
pub fn open_backend(location: &str) -> Box<dyn Cache> {
    if location.eq_ignore_ascii_case(MEMORY_CACHE_LOCATION) {
        Box::new(MemoryCache::new())
    } else {
        Box::new(SqliteCache::new(PathBuf::from(location)))
    }
}

/// Serializable crawler options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlerConfig {
    /// User-Agent header; the crate default when absent.
    pub user_agent: Option<String>,
    /// Cookies injected on every request.
    pub cookies: BTreeMap<String, String>,
    /// Raw `Cookie` header, used instead of `cookies` when set.
    pub raw_cookies: Option<String>,
    /// Worker pool capacity; requests run inline when absent.
    pub concurrency: Option<usize>,
    /// Log and survive handler panics inside the worker pool.
    pub block_panic: bool,
    /// Retries for non-2xx responses.
    pub retry_count: Option<u32>,
    /// Pause between retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Proxy URLs (http, https or socks5).
    pub proxies: Vec<String>,
    /// Response cache.
    pub cache: Option<CacheConfig>,
    /// Logger; none is installed when absent.
    pub log: Option<LogConfig>,
    /// Per-attempt transport timeout, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Backing store for request contexts.
    pub context_kind: ContextKind,
}

impl CrawlerConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, CrawlError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CrawlError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&text)
            .map_err(|e| CrawlError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded crawler config");
        Ok(config)
    }

    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] for malformed JSON or unknown fields.
    pub fn from_json_str(text: &str) -> Result<Self, CrawlError> {
        serde_json::from_str(text).map_err(|e| CrawlError::Config(e.to_string()))
    }

    /// Per-attempt timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::cache::CacheError;
    use crate::fingerprint::CacheFieldKind;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = CrawlerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CrawlerConfig::default());
        assert!(config.timeout().is_none());
        assert_eq!(config.context_kind, ContextKind::ReadHeavy);
    }

    #[test]
    fn test_full_config_parses() {
        let config = CrawlerConfig::from_json_str(
            r#"{
                "user_agent": "bot/1",
                "cookies": {"a": "1"},
                "concurrency": 4,
                "block_panic": true,
                "retry_count": 2,
                "retry_delay_ms": 50,
                "proxies": ["socks5://10.0.0.1:1080"],
                "cache": {"location": "memory", "compressed": true, "body_fields": ["user.id"]},
                "timeout_ms": 1500,
                "context_kind": "write_heavy"
            }"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, Some(4));
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.context_kind, ContextKind::WriteHeavy);
        let cache = config.cache.unwrap();
        assert!(cache.compressed);
        let fields = cache.fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].kind(), CacheFieldKind::Body);
        assert_eq!(fields[0].name(), "user.id");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            CrawlerConfig::from_json_str(r#"{"concurency": 4}"#),
            Err(CrawlError::Config(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"retry_count": 5}}"#).unwrap();
        let config = CrawlerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.retry_count, Some(5));

        assert!(matches!(
            CrawlerConfig::from_json_file(Path::new("/definitely/not/here.json")),
            Err(CrawlError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_backend_memory_and_sqlite() {
        let memory = open_backend("MEMORY");
        memory.init().await.unwrap();
        memory.cache("k", b"v").await.unwrap();
        assert!(memory.is_cached("k").await.unwrap().is_some());

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cache.db");
        let sqlite = open_backend(path.to_str().unwrap());
        assert!(matches!(
            sqlite.is_cached("k").await,
            Err(CacheError::NotInitialized)
        ));
        sqlite.init().await.unwrap();
        assert!(path.exists());
    }
}
