//! The crawler client: configuration, handler registration and dispatch.
//!
//! A [`Crawler`] is a cheaply clonable handle. Dispatch methods build a
//! [`Request`], seed it with the configured User-Agent and cookies, and run it
//! through the pipeline:
//!
//! 1. pre-request handlers (may mutate or abort the request)
//! 2. fingerprint and cache lookup, when a cache is attached
//! 3. transport through the proxy pool, evicting failing proxies
//! 4. retry while the retry predicate asks for it
//! 5. cache write for 200/201 responses
//! 6. response handlers, then HTML handlers, then JSON handlers
//!
//! Without a worker pool the dispatch call awaits the whole pipeline. With one
//! (`CrawlerBuilder::concurrency`) it returns once the request is queued, and
//! [`Crawler::wait`] joins the outstanding work.
//!
//! # Example
//!
//! ```no_run
//! use predator::{Crawler, LogConfig};
//!
//! # async fn example() -> Result<(), predator::CrawlError> {
//! let crawler = Crawler::builder()
//!     .concurrency(8, true)
//!     .logger(LogConfig::console("info"))
//!     .build()
//!     .await?;
//!
//! crawler.before_request(|_, req| req.ctx().put("started", "yes"));
//! crawler.after_response(|_, resp| {
//!     tracing::info!(status = resp.status(), url = %resp.request().url(), "fetched");
//! });
//! crawler.parse_html("a[href]", |_, link, _| {
//!     tracing::info!(index = link.index(), href = link.attr("href"), "link");
//! })?;
//!
//! crawler.get("https://example.com/").await?;
//! crawler.close().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod handler;
mod pipeline;
mod stats;

pub use builder::CrawlerBuilder;
pub use handler::{HtmlHandler, JsonHandler, RequestHandler, ResponseHandler};
pub use stats::CrawlStats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Method;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::Cache;
use crate::context::{Context, ContextPool};
use crate::error::CrawlError;
use crate::fingerprint::CacheField;
use crate::html::{HtmlElement, parse_selector};
use crate::multipart::MultipartForm;
use crate::pool::WorkerPool;
use crate::proxy::ProxyPool;
use crate::request::{BodyMap, Request};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

use handler::Handlers;

struct Inner {
    user_agent: String,
    cookie_header: Option<String>,
    contexts: ContextPool,
    next_id: AtomicU64,
    transport: Transport,
    proxies: Option<ProxyPool>,
    retry: Option<RetryPolicy>,
    cache: Option<Box<dyn Cache>>,
    cache_fields: Vec<CacheField>,
    workers: Option<WorkerPool>,
    handlers: Handlers,
    stats: CrawlStats,
    cancel: CancellationToken,
}

/// Shared handle to a configured crawler.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Crawler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crawler")
            .field("user_agent", &self.inner.user_agent)
            .field("proxies", &self.inner.proxies)
            .field("retry", &self.inner.retry)
            .field("cached", &self.inner.cache.is_some())
            .field("workers", &self.inner.workers)
            .field("timeout", &self.inner.transport.timeout())
            .finish_non_exhaustive()
    }
}

impl Crawler {
    /// Starts configuring a crawler.
    #[must_use]
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }

    /// Fetches `url` with a pooled context.
    ///
    /// # Errors
    ///
    /// Without a worker pool, any pipeline error; with one, only
    /// `InvalidUrl` or `PoolAlreadyClosed`.
    pub async fn get(&self, url: &str) -> Result<(), CrawlError> {
        self.request(Method::GET, url, Vec::new(), None, None, None)
            .await
    }

    /// Fetches `url`, sharing `ctx` with the handlers of this request.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn get_with_context(&self, url: &str, ctx: Context) -> Result<(), CrawlError> {
        self.request(Method::GET, url, Vec::new(), None, None, Some(ctx))
            .await
    }

    /// Posts an `application/x-www-form-urlencoded` form.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn post<I, K, V>(
        &self,
        url: &str,
        form: I,
        ctx: Option<Context>,
    ) -> Result<(), CrawlError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let form: BTreeMap<String, String> = form
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&form)
            .finish()
            .into_bytes();
        self.request(Method::POST, url, body, Some(BodyMap::Form(form)), None, ctx)
            .await
    }

    /// Posts `value` serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] if `value` cannot be serialized, otherwise
    /// see [`get`](Self::get).
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        value: &T,
        ctx: Option<Context>,
    ) -> Result<(), CrawlError> {
        let document = serde_json::to_value(value)
            .map_err(|e| CrawlError::Config(format!("cannot serialize JSON body: {e}")))?;
        let body = document.to_string().into_bytes();
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.request(
            Method::POST,
            url,
            body,
            Some(BodyMap::Json(document)),
            Some(headers),
            ctx,
        )
        .await
    }

    /// Posts a multipart form.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn post_multipart(
        &self,
        url: &str,
        form: MultipartForm,
        ctx: Option<Context>,
    ) -> Result<(), CrawlError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&form.content_type()) {
            headers.insert(reqwest::header::CONTENT_TYPE, value);
        }
        self.request(
            Method::POST,
            url,
            form.to_body(),
            Some(BodyMap::Multipart(form.text_fields())),
            Some(headers),
            ctx,
        )
        .await
    }

    /// Posts raw bytes. Body cache fields cannot be resolved for such requests.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn post_raw(
        &self,
        url: &str,
        body: Vec<u8>,
        ctx: Option<Context>,
    ) -> Result<(), CrawlError> {
        self.request(Method::POST, url, body, None, None, ctx).await
    }

    /// Builds a request and runs it inline or through the worker pool.
    ///
    /// `headers` overlay the seeded User-Agent and cookies.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::InvalidUrl`] for an unparsable URL, and otherwise
    /// what [`get`](Self::get) documents.
    #[instrument(level = "debug", skip(self, body, body_map, headers, ctx))]
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Vec<u8>,
        body_map: Option<BodyMap>,
        headers: Option<HeaderMap>,
        ctx: Option<Context>,
    ) -> Result<(), CrawlError> {
        let target = Url::parse(url).map_err(|_| CrawlError::invalid_url(url))?;
        let ctx = ctx.unwrap_or_else(|| self.inner.contexts.acquire());
        let mut request = Request::new(method, target, ctx).with_body(body, body_map);
        self.seed_headers(&mut request, headers);
        request.set_id(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.stats.record_request();

        match &self.inner.workers {
            Some(workers) => {
                let crawler = self.clone();
                workers
                    .submit(async move { crawler.run_pipeline(request).await })
                    .await?;
                Ok(())
            }
            None => self.run_pipeline(request).await,
        }
    }

    /// Registers a closure run before each request.
    pub fn before_request<F>(&self, handler: F)
    where
        F: Fn(&Crawler, &mut Request) + Send + Sync + 'static,
    {
        self.on_request(handler);
    }

    /// Registers a pre-request handler.
    pub fn on_request(&self, handler: impl RequestHandler + 'static) {
        self.inner.handlers.add_request(Arc::new(handler));
    }

    /// Registers a closure run for every response.
    pub fn after_response<F>(&self, handler: F)
    where
        F: Fn(&Crawler, &Response) + Send + Sync + 'static,
    {
        self.on_response(handler);
    }

    /// Registers a response handler.
    pub fn on_response(&self, handler: impl ResponseHandler + 'static) {
        self.inner.handlers.add_response(Arc::new(handler));
    }

    /// Registers a closure run for each element matching `selector` in HTML
    /// responses.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::InvalidSelector`] if `selector` does not parse.
    pub fn parse_html<F>(&self, selector: &str, handler: F) -> Result<(), CrawlError>
    where
        F: Fn(&Crawler, &HtmlElement, &Response) + Send + Sync + 'static,
    {
        self.on_html(selector, handler)
    }

    /// Registers an HTML handler for `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::InvalidSelector`] if `selector` does not parse.
    pub fn on_html(
        &self,
        selector: &str,
        handler: impl HtmlHandler + 'static,
    ) -> Result<(), CrawlError> {
        let selector = parse_selector(selector)?;
        self.inner.handlers.add_html(selector, Arc::new(handler));
        Ok(())
    }

    /// Registers a closure run with decoded JSON bodies.
    ///
    /// With `strict`, only responses whose `Content-Type` contains `json` are
    /// considered; otherwise any body that parses as JSON is delivered.
    pub fn parse_json<F>(&self, strict: bool, handler: F)
    where
        F: Fn(&Crawler, &serde_json::Value, &Response) + Send + Sync + 'static,
    {
        self.on_json(strict, handler);
    }

    /// Registers a JSON handler.
    pub fn on_json(&self, strict: bool, handler: impl JsonHandler + 'static) {
        self.inner.handlers.add_json(strict, Arc::new(handler));
    }

    /// Waits until every queued request has finished. Returns immediately
    /// without a worker pool.
    pub async fn wait(&self) {
        if let Some(workers) = &self.inner.workers {
            workers.wait().await;
        }
    }

    /// Stops accepting requests and drains the worker pool.
    pub async fn close(&self) {
        if let Some(workers) = &self.inner.workers {
            workers.close().await;
        }
        info!(
            requests = self.inner.stats.requests(),
            responses = self.inner.stats.responses(),
            cache_hits = self.inner.stats.cache_hits(),
            failed = self.inner.stats.failed(),
            "crawler closed"
        );
    }

    /// Cancels in-flight transport attempts, then closes the crawler.
    ///
    /// Cancelled pipelines end with [`CrawlError::Cancelled`].
    pub async fn shutdown(&self) {
        warn!("crawler shutting down, cancelling in-flight requests");
        self.inner.cancel.cancel();
        self.close().await;
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Removes every cached response.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::NoCacheSet`] without a cache, or the backend error.
    pub async fn clear_cache(&self) -> Result<(), CrawlError> {
        let cache = self.inner.cache.as_ref().ok_or(CrawlError::NoCacheSet)?;
        cache.clear().await?;
        debug!("cache cleared");
        Ok(())
    }

    /// Crawl counters.
    #[must_use]
    pub fn stats(&self) -> &CrawlStats {
        &self.inner.stats
    }

    /// The proxy pool, if one is configured.
    #[must_use]
    pub fn proxy_pool(&self) -> Option<&ProxyPool> {
        self.inner.proxies.as_ref()
    }

    /// The worker pool, if one is configured.
    #[must_use]
    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.inner.workers.as_ref()
    }

    /// The context pool feeding requests dispatched without a context.
    #[must_use]
    pub fn context_pool(&self) -> &ContextPool {
        &self.inner.contexts
    }

    /// Applies the crawler's User-Agent and cookies, then the caller's headers.
    fn seed_headers(&self, request: &mut Request, overlay: Option<HeaderMap>) {
        request.set_header(USER_AGENT.as_str(), &self.inner.user_agent);
        if let Some(cookies) = &self.inner.cookie_header {
            request.set_header(COOKIE.as_str(), cookies);
        }
        if let Some(overlay) = overlay {
            let headers = request.headers_mut();
            let mut last = None;
            for (name, value) in overlay {
                // HeaderMap iteration yields the name only for the first value.
                if let Some(name) = name {
                    headers.insert(name.clone(), value);
                    last = Some(name);
                } else if let Some(name) = &last {
                    headers.append(name.clone(), value);
                }
            }
        }
    }
}
