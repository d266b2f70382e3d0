//! Self-healing pool of proxy endpoints.
//!
//! The pool hands out a uniformly random proxy for every transport attempt and
//! shrinks when a proxy fails: the pipeline calls [`ProxyPool::remove`] with the
//! `host:port` carried by the typed transport error. When the pool runs dry an
//! optional replenisher is asked for a fresh list.
//!
//! One mutex covers selection, eviction and replenishment so two workers that
//! fail on the same proxy cannot remove it twice or refill the pool twice.
//!
//! # Example
//!
//! ```
//! use predator::proxy::ProxyPool;
//!
//! # fn example() -> Result<(), predator::CrawlError> {
//! let pool = ProxyPool::new(["http://10.0.0.1:3128", "socks5://10.0.0.2:1080"])?;
//! let chosen = pool.select()?;
//! assert!(pool.contains(&chosen));
//! pool.remove("10.0.0.1:3128")?;
//! assert_eq!(pool.size(), 1);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::CrawlError;

/// Schemes a proxy URL may use.
pub const SUPPORTED_SCHEMES: [&str; 3] = ["http", "https", "socks5"];

/// Callback producing a fresh proxy list when the pool is exhausted.
pub type Replenisher = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Parses and validates a proxy URL.
///
/// # Errors
///
/// - [`CrawlError::InvalidProxy`] if the string is not a URL with a host.
/// - [`CrawlError::UnknownProtocol`] if the scheme is not http, https or socks5.
pub fn parse_proxy(raw: &str) -> Result<Url, CrawlError> {
    let url = Url::parse(raw.trim()).map_err(|e| CrawlError::invalid_proxy(raw, e.to_string()))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(CrawlError::unknown_protocol(raw, url.scheme()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(CrawlError::invalid_proxy(raw, "missing host"));
    }
    Ok(url)
}

/// Returns the `host:port` a proxy dials, filling in the scheme's default port.
#[must_use]
pub fn proxy_addr(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port().unwrap_or(match url.scheme() {
        "https" => 443,
        "socks5" => 1080,
        _ => 80,
    });
    format!("{host}:{port}")
}

/// Normalizes an address given as URL or bare `host:port`.
fn normalize_addr(addr: &str) -> String {
    if addr.contains("://") {
        if let Ok(url) = Url::parse(addr) {
            return proxy_addr(&url);
        }
    }
    // Strip userinfo from bare `user:pass@host:port`.
    addr.rsplit('@').next().unwrap_or(addr).to_string()
}

/// Ordered set of proxy URLs with random selection and failure-driven eviction.
pub struct ProxyPool {
    entries: Mutex<Vec<Url>>,
    replenisher: Option<Replenisher>,
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("size", &self.size())
            .field("replenishable", &self.replenisher.is_some())
            .finish()
    }
}

impl ProxyPool {
    /// Creates a pool from proxy URL strings.
    ///
    /// # Errors
    ///
    /// Returns the first [`parse_proxy`] failure.
    pub fn new<I, S>(proxies: I) -> Result<Self, CrawlError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = proxies
            .into_iter()
            .map(|raw| parse_proxy(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            entries: Mutex::new(entries),
            replenisher: None,
        })
    }

    /// Installs a replenisher consulted whenever the pool becomes empty.
    #[must_use]
    pub fn with_replenisher(
        mut self,
        replenisher: impl Fn() -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.replenisher = Some(Arc::new(replenisher));
        self
    }

    /// Installs an already shared replenisher.
    #[must_use]
    pub fn with_shared_replenisher(mut self, replenisher: Replenisher) -> Self {
        self.replenisher = Some(replenisher);
        self
    }

    /// Returns a uniformly random proxy.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::EmptyProxyPool`] when the pool is empty and the
    /// replenisher is absent or yields nothing usable.
    pub fn select(&self) -> Result<Url, CrawlError> {
        let mut entries = self.lock();
        if entries.is_empty() {
            self.replenish(&mut entries);
        }
        if entries.is_empty() {
            return Err(CrawlError::EmptyProxyPool);
        }
        let index = rand::thread_rng().gen_range(0..entries.len());
        Ok(entries[index].clone())
    }

    /// Evicts the first proxy whose `host:port` matches `addr`.
    ///
    /// Removing an address that is no longer present is a no-op, which makes
    /// concurrent evictions of the same proxy safe.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::EmptyProxyPool`] if the pool is empty afterwards
    /// and could not be replenished.
    pub fn remove(&self, addr: &str) -> Result<(), CrawlError> {
        let target = normalize_addr(addr);
        let mut entries = self.lock();
        match entries.iter().position(|url| proxy_addr(url) == target) {
            Some(index) => {
                entries.remove(index);
                info!(proxy = %target, remaining = entries.len(), "evicted proxy");
            }
            None => debug!(proxy = %target, "proxy already evicted"),
        }
        if entries.is_empty() {
            self.replenish(&mut entries);
            if entries.is_empty() {
                return Err(CrawlError::EmptyProxyPool);
            }
        }
        Ok(())
    }

    /// Number of proxies currently in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Whether `proxy` is currently in the pool.
    #[must_use]
    pub fn contains(&self, proxy: &Url) -> bool {
        self.lock().iter().any(|url| url == proxy)
    }

    /// Copy of the current entries, in order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Url> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Url>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replenish(&self, entries: &mut Vec<Url>) {
        let Some(replenisher) = &self.replenisher else {
            return;
        };
        for raw in replenisher() {
            match parse_proxy(&raw) {
                Ok(url) => entries.push(url),
                Err(error) => warn!(proxy = %raw, error = %error, "skipping replenished proxy"),
            }
        }
        info!(size = entries.len(), "replenished proxy pool");
    }
}
