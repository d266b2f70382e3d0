//! The per-request pipeline.

use tracing::{debug, instrument, warn};
use url::Url;

use super::Crawler;
use crate::cache::CacheError;
use crate::context::{Context, ContextPool};
use crate::error::CrawlError;
use crate::fingerprint::fingerprint;
use crate::html;
use crate::proxy::{parse_proxy, proxy_addr};
use crate::request::Request;
use crate::response::{RawResponse, RecordError, Response, raw_from_cache_bytes};

/// Hands the request's context back to the crawler's pool when the pipeline
/// ends, however it ends.
struct ContextLease<'a> {
    contexts: &'a ContextPool,
    ctx: Option<Context>,
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.contexts.release(ctx);
        }
    }
}

impl Crawler {
    /// Runs one request to completion, recording failures in the stats.
    #[instrument(
        level = "debug",
        skip(self, request),
        fields(request_id = request.id(), method = %request.method(), url = %request.url())
    )]
    pub(crate) async fn run_pipeline(&self, request: Request) -> Result<(), CrawlError> {
        let lease = ContextLease {
            contexts: &self.inner.contexts,
            ctx: Some(request.ctx().clone()),
        };
        let result = self.drive(request).await;
        drop(lease);

        if let Err(error) = &result {
            self.inner.stats.record_failure();
            warn!(%error, "request failed");
        }
        result
    }

    async fn drive(&self, mut request: Request) -> Result<(), CrawlError> {
        for handler in self.inner.handlers.request() {
            handler.on_request(self, &mut request).await;
            if request.is_aborted() {
                debug!("request aborted by handler");
                self.inner.stats.record_aborted();
                return Ok(());
            }
        }

        let Some(cache) = &self.inner.cache else {
            let response = self.fetch(request).await?;
            self.dispatch(&response).await;
            return Ok(());
        };

        let key = fingerprint(&request, &self.inner.cache_fields)?;
        if let Some(bytes) = cache.is_cached(&key).await? {
            let raw = raw_from_cache_bytes(&bytes).map_err(CacheError::from)?;
            debug!(fingerprint = %key, status = raw.status, "cache hit");
            self.inner.stats.record_cache_hit();
            let response = Response::new(raw, request, true);
            self.dispatch(&response).await;
            return Ok(());
        }

        let response = self.fetch(request).await?;
        if response.is_cacheable() {
            let bytes = response
                .to_cache_bytes()
                .map_err(|e| CacheError::Record(RecordError::Json(e)))?;
            cache.cache(&key, &bytes).await?;
            debug!(fingerprint = %key, "response cached");
        }
        self.dispatch(&response).await;
        Ok(())
    }

    /// Transport plus bounded retry.
    async fn fetch(&self, mut request: Request) -> Result<Response, CrawlError> {
        loop {
            let raw = self.transport_with_eviction(&request).await?;
            self.inner.stats.record_response();
            let response = Response::new(raw, request, false);

            let Some(policy) = &self.inner.retry else {
                return Ok(response);
            };
            if !policy.should_retry(&response) {
                return Ok(response);
            }

            let status = response.status();
            request = response.into_request();
            request.increment_retry();
            self.inner.stats.record_retry();
            debug!(status, attempt = request.retry_counter(), "retrying request");
            if !policy.delay().is_zero() {
                tokio::time::sleep(policy.delay()).await;
            }
        }
    }

    /// Executes one attempt, evicting pooled proxies that fail and
    /// re-attempting with the next one until the pool runs dry.
    async fn transport_with_eviction(&self, request: &Request) -> Result<RawResponse, CrawlError> {
        loop {
            let (proxy, pooled) = self.choose_proxy(request)?;

            let attempt = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => Err(CrawlError::Cancelled {
                    url: request.url().to_string(),
                }),
                result = self.inner.transport.execute(request, proxy.as_ref()) => result,
            };

            match attempt {
                Err(error) if pooled && error.evictable_proxy().is_some() => {
                    let addr = error
                        .evictable_proxy()
                        .map(str::to_string)
                        .or_else(|| proxy.as_ref().map(proxy_addr))
                        .unwrap_or_default();
                    warn!(proxy = %addr, %error, "evicting proxy");
                    self.inner.stats.record_eviction();
                    if let Some(pool) = &self.inner.proxies {
                        pool.remove(&addr)?;
                    }
                }
                other => return other,
            }
        }
    }

    /// A per-request proxy wins over the pool and is never evicted.
    fn choose_proxy(&self, request: &Request) -> Result<(Option<Url>, bool), CrawlError> {
        if let Some(raw) = request.proxy() {
            return Ok((Some(parse_proxy(raw)?), false));
        }
        match &self.inner.proxies {
            Some(pool) => Ok((Some(pool.select()?), true)),
            None => Ok((None, false)),
        }
    }

    /// Response handlers, then HTML handlers, then JSON handlers.
    async fn dispatch(&self, response: &Response) {
        for handler in self.inner.handlers.response() {
            handler.on_response(self, response).await;
        }

        let html_entries = self.inner.handlers.html();
        if !html_entries.is_empty() && response.is_html() {
            let batches = html::select_each(
                &response.text(),
                html_entries.iter().map(|(selector, _)| selector),
            );
            for ((_, handler), elements) in html_entries.iter().zip(batches) {
                for element in &elements {
                    handler.on_element(self, element, response).await;
                }
            }
        }

        let json_entries: Vec<_> = self
            .inner
            .handlers
            .json()
            .into_iter()
            .filter(|(strict, _)| !strict || response.is_json())
            .collect();
        if json_entries.is_empty() {
            return;
        }
        match serde_json::from_slice::<serde_json::Value>(response.body()) {
            Ok(document) => {
                for (_, handler) in json_entries {
                    handler.on_json(self, &document, response).await;
                }
            }
            Err(error) => debug!(%error, "response body is not JSON, skipping JSON handlers"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    #[tokio::test]
    async fn test_context_returned_to_pool_after_pipeline() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let crawler = Crawler::builder().build().await.unwrap();
        assert_eq!(crawler.context_pool().idle(), 0);
        crawler.get(&format!("{}/", server.uri())).await.unwrap();
        assert_eq!(crawler.context_pool().idle(), 1);
    }

    #[tokio::test]
    async fn test_caller_context_is_not_recycled() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let crawler = Crawler::builder().build().await.unwrap();
        let ctx = Context::default();
        ctx.put("keep", "me");
        crawler
            .get_with_context(&format!("{}/", server.uri()), ctx.clone())
            .await
            .unwrap();
        assert_eq!(ctx.get_string("keep"), "me");
        assert_eq!(crawler.context_pool().idle(), 0);
    }

    #[tokio::test]
    async fn test_abort_skips_transport_and_handlers() {
        let crawler = Crawler::builder().build().await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        crawler.before_request(|_, req| req.abort());
        let counter = Arc::clone(&seen);
        crawler.after_response(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Nothing listens here; an attempted dial would fail the call.
        crawler.get("http://127.0.0.1:9/").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(crawler.stats().aborted(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_retry_and_transport() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body"))
            .expect(1)
            .mount(&server)
            .await;

        let crawler = Crawler::builder()
            .cache(MemoryCache::new(), true, Vec::new())
            .retry(3, |resp| resp.status() != 200)
            .build()
            .await
            .unwrap();
        let flags = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flags);
        crawler.after_response(move |_, resp| {
            sink.lock().unwrap().push((resp.from_cache(), resp.text()));
        });

        let url = format!("{}/page", server.uri());
        crawler.get(&url).await.unwrap();
        crawler.get(&url).await.unwrap();

        let flags = flags.lock().unwrap();
        assert_eq!(
            *flags,
            vec![(false, "body".to_string()), (true, "body".to_string())]
        );
        assert_eq!(crawler.stats().cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_non_success_is_not_cached() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let crawler = Crawler::builder()
            .cache(MemoryCache::new(), false, Vec::new())
            .build()
            .await
            .unwrap();
        let url = format!("{}/missing", server.uri());
        crawler.get(&url).await.unwrap();
        crawler.get(&url).await.unwrap();
        assert_eq!(crawler.stats().cache_hits(), 0);
    }

    #[tokio::test]
    async fn test_json_handlers_respect_strictness() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"name":"predator"}"#, "text/plain"),
            )
            .mount(&server)
            .await;

        let crawler = Crawler::builder().build().await.unwrap();
        let strict_calls = Arc::new(AtomicUsize::new(0));
        let lenient_names = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&strict_calls);
        crawler.parse_json(true, move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let names = Arc::clone(&lenient_names);
        crawler.parse_json(false, move |_, json, _| {
            names
                .lock()
                .unwrap()
                .push(json["name"].as_str().unwrap_or_default().to_string());
        });

        crawler.get(&format!("{}/", server.uri())).await.unwrap();
        assert_eq!(strict_calls.load(Ordering::SeqCst), 0);
        assert_eq!(*lenient_names.lock().unwrap(), vec!["predator".to_string()]);
    }

    #[tokio::test]
    async fn test_per_request_invalid_proxy_fails_pipeline() {
        let crawler = Crawler::builder().build().await.unwrap();
        crawler.before_request(|_, req| req.set_proxy("ftp://10.0.0.1:21"));
        let result = crawler.get("http://predator.test/").await;
        assert!(matches!(result, Err(CrawlError::UnknownProtocol { .. })));
        assert_eq!(crawler.stats().failed(), 1);
    }
}
