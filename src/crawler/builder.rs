//! Crawler construction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handler::Handlers;
use super::{CrawlStats, Crawler, Inner};
use crate::cache::Cache;
use crate::config::CrawlerConfig;
use crate::context::{ContextKind, ContextPool, DEFAULT_CONTEXT_POOL_CAPACITY};
use crate::error::CrawlError;
use crate::fingerprint::CacheField;
use crate::logging::{self, LogConfig};
use crate::pool::WorkerPool;
use crate::proxy::{ProxyPool, Replenisher};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::user_agent::{cookie_header, default_user_agent};

enum Cookies {
    None,
    Map(BTreeMap<String, String>),
    Raw(String),
}

struct CacheSetup {
    backend: Box<dyn Cache>,
    compressed: bool,
    fields: Vec<CacheField>,
}

/// Configures a [`Crawler`].
///
/// Every option is optional; [`build`](Self::build) validates the whole set and
/// initializes the cache backend.
pub struct CrawlerBuilder {
    user_agent: Option<String>,
    cookies: Cookies,
    concurrency: Option<(usize, bool)>,
    retry: Option<RetryPolicy>,
    proxies: Vec<String>,
    replenisher: Option<Replenisher>,
    cache: Option<CacheSetup>,
    log: Option<LogConfig>,
    timeout: Option<Duration>,
    context_kind: ContextKind,
    context_capacity: usize,
}

impl fmt::Debug for CrawlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlerBuilder")
            .field("user_agent", &self.user_agent)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("proxies", &self.proxies)
            .field("replenisher", &self.replenisher.is_some())
            .field("cached", &self.cache.is_some())
            .field("log", &self.log)
            .field("timeout", &self.timeout)
            .field("context_kind", &self.context_kind)
            .finish_non_exhaustive()
    }
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerBuilder {
    /// A builder with every option unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_agent: None,
            cookies: Cookies::None,
            concurrency: None,
            retry: None,
            proxies: Vec::new(),
            replenisher: None,
            cache: None,
            log: None,
            timeout: None,
            context_kind: ContextKind::default(),
            context_capacity: DEFAULT_CONTEXT_POOL_CAPACITY,
        }
    }

    /// Seeds a builder from a data-only configuration.
    #[must_use]
    pub fn from_config(config: CrawlerConfig) -> Self {
        let mut builder = Self::new().context_kind(config.context_kind);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(raw) = config.raw_cookies {
            builder = builder.raw_cookies(raw);
        } else if !config.cookies.is_empty() {
            builder = builder.cookies(config.cookies);
        }
        if let Some(concurrency) = config.concurrency {
            builder = builder.concurrency(concurrency, config.block_panic);
        }
        if let Some(count) = config.retry_count {
            builder = builder.retry_policy(
                RetryPolicy::on_failure_status(count)
                    .with_delay(Duration::from_millis(config.retry_delay_ms)),
            );
        }
        if !config.proxies.is_empty() {
            builder = builder.proxy_pool(config.proxies);
        }
        if let Some(cache) = config.cache {
            builder = builder.cache_backend(cache.backend(), cache.compressed, cache.fields());
        }
        if let Some(log) = config.log {
            builder = builder.logger(log);
        }
        if let Some(timeout) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        builder
    }

    /// Sets the `User-Agent` header sent with every request.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sends these cookies with every request.
    #[must_use]
    pub fn cookies<I, K, V>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.cookies = Cookies::Map(
            cookies
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Sends a raw `Cookie` header with every request.
    #[must_use]
    pub fn raw_cookies(mut self, header: impl Into<String>) -> Self {
        self.cookies = Cookies::Raw(header.into());
        self
    }

    /// Runs requests on a worker pool of `capacity` workers.
    ///
    /// With `block_panic`, a panicking handler is logged and its worker
    /// replaced; otherwise the panic propagates out of the worker task.
    #[must_use]
    pub fn concurrency(mut self, capacity: usize, block_panic: bool) -> Self {
        self.concurrency = Some((capacity, block_panic));
        self
    }

    /// Retries up to `count` times while `predicate` holds for the response.
    #[must_use]
    pub fn retry(
        self,
        count: u32,
        predicate: impl Fn(&Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_policy(RetryPolicy::new(count, predicate))
    }

    /// Installs a prepared retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Adds one proxy to the pool.
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxies.push(proxy.into());
        self
    }

    /// Adds several proxies to the pool.
    #[must_use]
    pub fn proxy_pool<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies.extend(proxies.into_iter().map(Into::into));
        self
    }

    /// Refills the proxy pool from `replenisher` whenever it empties.
    #[must_use]
    pub fn replenish_proxy_pool(
        mut self,
        replenisher: impl Fn() -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.replenisher = Some(Arc::new(replenisher));
        self
    }

    /// Caches 200/201 responses in `backend`, fingerprinted with `fields`.
    #[must_use]
    pub fn cache<C: Cache + 'static>(
        self,
        backend: C,
        compressed: bool,
        fields: Vec<CacheField>,
    ) -> Self {
        self.cache_backend(Box::new(backend), compressed, fields)
    }

    /// Like [`cache`](Self::cache) for an already boxed backend.
    #[must_use]
    pub fn cache_backend(
        mut self,
        backend: Box<dyn Cache>,
        compressed: bool,
        fields: Vec<CacheField>,
    ) -> Self {
        self.cache = Some(CacheSetup {
            backend,
            compressed,
            fields,
        });
        self
    }

    /// Installs a global logger when the crawler is built.
    #[must_use]
    pub fn logger(mut self, config: LogConfig) -> Self {
        self.log = Some(config);
        self
    }

    /// Bounds each transport attempt.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Backing store for pooled request contexts.
    #[must_use]
    pub fn context_kind(mut self, kind: ContextKind) -> Self {
        self.context_kind = kind;
        self
    }

    /// Maximum number of idle contexts kept for reuse.
    #[must_use]
    pub fn context_pool_capacity(mut self, capacity: usize) -> Self {
        self.context_capacity = capacity;
        self
    }

    /// Validates the options and builds the crawler.
    ///
    /// # Errors
    ///
    /// - [`CrawlError::Logger`] if the logger cannot be installed
    /// - [`CrawlError::InvalidProxy`] / [`CrawlError::UnknownProtocol`] for a
    ///   bad proxy URL
    /// - [`CrawlError::InvalidPoolCap`] for a zero concurrency
    /// - [`CrawlError::Cache`] if the cache backend fails to initialize
    pub async fn build(self) -> Result<Crawler, CrawlError> {
        if let Some(log) = &self.log {
            logging::init(log)?;
        }

        let proxies = if self.proxies.is_empty() && self.replenisher.is_none() {
            None
        } else {
            let mut pool = ProxyPool::new(&self.proxies)?;
            if let Some(replenisher) = self.replenisher {
                pool = pool.with_shared_replenisher(replenisher);
            }
            Some(pool)
        };

        let workers = self
            .concurrency
            .map(|(capacity, block_panic)| WorkerPool::new(capacity, block_panic))
            .transpose()?;

        let (cache, cache_fields) = match self.cache {
            Some(mut setup) => {
                setup.backend.set_compression(setup.compressed);
                setup.backend.init().await?;
                (Some(setup.backend), setup.fields)
            }
            None => (None, Vec::new()),
        };

        let transport = Transport::new(self.timeout)?;
        let user_agent = self.user_agent.unwrap_or_else(default_user_agent);
        let cookie_header = match self.cookies {
            Cookies::None => None,
            Cookies::Map(map) if map.is_empty() => None,
            Cookies::Map(map) => Some(cookie_header(&map)),
            Cookies::Raw(raw) => Some(raw),
        };

        debug!(
            proxies = proxies.as_ref().map_or(0, ProxyPool::size),
            workers = workers.as_ref().map_or(0, WorkerPool::capacity),
            cached = cache.is_some(),
            "crawler configured"
        );
        info!(user_agent = %user_agent, "crawler ready");

        Ok(Crawler {
            inner: Arc::new(Inner {
                user_agent,
                cookie_header,
                contexts: ContextPool::new(self.context_kind, self.context_capacity),
                next_id: AtomicU64::new(0),
                transport,
                proxies,
                retry: self.retry,
                cache,
                cache_fields,
                workers,
                handlers: Handlers::default(),
                stats: CrawlStats::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }
}
