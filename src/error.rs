//! Error types surfaced by the crawler.
//!
//! Every dispatch operation returns `Result<_, CrawlError>`. Proxy failures that
//! the pipeline can recover from (eviction + re-attempt) never reach the caller;
//! they are still modelled here because the transport produces them and tests
//! observe them directly.

use thiserror::Error;

use crate::cache::CacheError;
use crate::pool::PoolError;

/// Errors that can occur while configuring a crawler or running a request.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// A configured proxy URL could not be parsed.
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy {
        /// The proxy string as supplied.
        proxy: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A proxy URL uses a scheme other than http, https or socks5.
    #[error("unknown proxy protocol {scheme:?} for {proxy}")]
    UnknownProtocol {
        /// The offending proxy.
        proxy: String,
        /// The unsupported scheme.
        scheme: String,
    },

    /// Dialing through a proxy failed.
    #[error("proxy {proxy} is invalid: {message}")]
    ProxyInvalid {
        /// `host:port` of the proxy that failed.
        proxy: String,
        /// The underlying transport message.
        message: String,
    },

    /// A proxy accepted the connection but timed out.
    #[error("proxy {proxy} expired: {message}")]
    ProxyExpired {
        /// `host:port` of the proxy that timed out.
        proxy: String,
        /// The underlying transport message.
        message: String,
    },

    /// The proxy refused to open a tunnel to the target.
    #[error("proxy {proxy} unable to connect to {target}")]
    ProxyUnableToConnect {
        /// `host:port` of the proxy.
        proxy: String,
        /// The tunnel target.
        target: String,
    },

    /// The proxy pool is empty and could not be replenished.
    #[error("proxy pool is empty")]
    EmptyProxyPool,

    /// A cache operation was requested but no cache is attached.
    #[error("no cache is set on this crawler")]
    NoCacheSet,

    /// A registered cache field is absent from the request.
    #[error("cache field {field:?} missing from request {location}")]
    CacheFieldMissing {
        /// The missing field name.
        field: String,
        /// Where it was looked up (`query` or `body`).
        location: &'static str,
    },

    /// A body cache field was registered but the request method carries no body.
    #[error("cache field {field:?} of type body is not allowed for {method} requests")]
    CacheFieldTypeNotAllowed {
        /// The rejected field name.
        field: String,
        /// The request method.
        method: String,
    },

    /// The worker pool has been closed.
    #[error("worker pool already closed")]
    PoolAlreadyClosed,

    /// The worker pool capacity is not a positive integer.
    #[error("invalid worker pool capacity {capacity}: must be at least 1")]
    InvalidPoolCap {
        /// The rejected capacity.
        capacity: usize,
    },

    /// Transport failure not attributable to a proxy.
    #[error("request to {url} failed: {message}")]
    RequestFailed {
        /// Target URL.
        url: String,
        /// The underlying transport message.
        message: String,
    },

    /// The transport attempt exceeded the configured timeout.
    #[error("timeout requesting {url}")]
    Timeout {
        /// Target URL.
        url: String,
    },

    /// A redirect was followed but the response carried no usable `Location`.
    #[error("invalid response status {status} from {url}: missing Location header")]
    InvalidResponseStatus {
        /// Target URL.
        url: String,
        /// The redirect status.
        status: u16,
    },

    /// The request URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A CSS selector registered with `parse_html` could not be parsed.
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector {
        /// The selector as supplied.
        selector: String,
        /// Parser message.
        message: String,
    },

    /// Cache backend failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Logger could not be configured.
    #[error("logger configuration failed: {0}")]
    Logger(String),

    /// Crawler configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// The crawler was shut down while the request was in flight.
    #[error("request {url} cancelled by crawler shutdown")]
    Cancelled {
        /// Target URL.
        url: String,
    },
}

impl CrawlError {
    /// Creates an invalid-proxy error.
    pub fn invalid_proxy(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProxy {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown-protocol error.
    pub fn unknown_protocol(proxy: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self::UnknownProtocol {
            proxy: proxy.into(),
            scheme: scheme.into(),
        }
    }

    /// Creates a proxy-invalid error.
    pub fn proxy_invalid(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProxyInvalid {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates a proxy-expired error.
    pub fn proxy_expired(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProxyExpired {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates a cache-field-missing error.
    pub fn cache_field_missing(field: impl Into<String>, location: &'static str) -> Self {
        Self::CacheFieldMissing {
            field: field.into(),
            location,
        }
    }

    /// Creates a request-failed error.
    pub fn request_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns the offending `host:port` when the error is attributable to a proxy
    /// and the pipeline should evict it.
    #[must_use]
    pub fn evictable_proxy(&self) -> Option<&str> {
        match self {
            Self::ProxyInvalid { proxy, .. }
            | Self::ProxyExpired { proxy, .. }
            | Self::ProxyUnableToConnect { proxy, .. } => Some(proxy),
            _ => None,
        }
    }
}

impl From<PoolError> for CrawlError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::AlreadyClosed => Self::PoolAlreadyClosed,
            PoolError::InvalidCapacity { capacity } => Self::InvalidPoolCap { capacity },
        }
    }
}
