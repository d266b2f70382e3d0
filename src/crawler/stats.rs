//! Crawl statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters updated by every pipeline of a crawler.
///
/// Uses atomic counters so workers update them without locking; reads are
/// point-in-time snapshots.
#[derive(Debug, Default)]
pub struct CrawlStats {
    requests: AtomicUsize,
    responses: AtomicUsize,
    cache_hits: AtomicUsize,
    retries: AtomicUsize,
    proxy_evictions: AtomicUsize,
    aborted: AtomicUsize,
    failed: AtomicUsize,
}

impl CrawlStats {
    /// Creates a tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests dispatched.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Responses received from the wire (retries included, cache hits excluded).
    #[must_use]
    pub fn responses(&self) -> usize {
        self.responses.load(Ordering::SeqCst)
    }

    /// Responses served from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::SeqCst)
    }

    /// Retries triggered by the retry predicate.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }

    /// Proxies evicted after a failed attempt.
    #[must_use]
    pub fn proxy_evictions(&self) -> usize {
        self.proxy_evictions.load(Ordering::SeqCst)
    }

    /// Requests aborted by a pre-request handler.
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Pipelines that ended in an error.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_eviction(&self) {
        self.proxy_evictions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}
