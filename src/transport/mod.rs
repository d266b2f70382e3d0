//! HTTP transport: turns a resolved [`Request`] into a [`RawResponse`].
//!
//! The transport wraps `reqwest` with automatic redirects disabled. Redirects
//! are followed here, up to the request's `allow_redirect(n)` budget, so a
//! crawler never follows one it was not asked to.
//!
//! One `reqwest::Client` is built per proxy URL and cached; the direct client
//! ignores `HTTP_PROXY`-style environment variables so traffic only goes
//! through proxies the crawler was configured with.
//!
//! Plain-HTTP targets behind an HTTP(S) proxy go through a CONNECT tunnel
//! opened in [`tunnel`] rather than reqwest's absolute-form forwarding. HTTPS
//! targets already tunnel inside reqwest; SOCKS5 is negotiated by reqwest.
//!
//! Transport failures are classified in [`error_mapping`]: anything caused by
//! a proxy carries that proxy's `host:port` so the pipeline can evict it.

mod error_mapping;
mod tunnel;

use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Method, Proxy};
use tracing::{debug, instrument, trace};
use url::Url;

use crate::error::CrawlError;
use crate::proxy::proxy_addr;
use crate::request::Request;
use crate::response::RawResponse;

use error_mapping::map_transport_error;

/// Default TCP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Reqwest-backed transport with a per-proxy client cache.
#[derive(Debug)]
pub struct Transport {
    direct: Client,
    proxied: DashMap<String, Client>,
    timeout: Option<Duration>,
}

impl Transport {
    /// Creates a transport. `timeout` bounds each attempt, not the retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] if the HTTP client cannot be built.
    pub fn new(timeout: Option<Duration>) -> Result<Self, CrawlError> {
        let direct = base_client_builder()
            .no_proxy()
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            direct,
            proxied: DashMap::new(),
            timeout,
        })
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Executes `request`, optionally through `proxy`, following redirects
    /// within the request's budget.
    ///
    /// # Errors
    ///
    /// - Proxy-attributable failures: `ProxyInvalid`, `ProxyExpired`,
    ///   `ProxyUnableToConnect`
    /// - `Timeout` / `RequestFailed` for direct failures
    /// - `InvalidResponseStatus` for a followed redirect without `Location`
    #[instrument(
        level = "debug",
        skip(self, request, proxy),
        fields(request_id = request.id(), url = %request.url(), proxy = proxy.map(Url::as_str))
    )]
    pub async fn execute(
        &self,
        request: &Request,
        proxy: Option<&Url>,
    ) -> Result<RawResponse, CrawlError> {
        let client = match proxy {
            Some(proxy) => self.client_for(proxy)?,
            None => self.direct.clone(),
        };

        let mut method = request.method().clone();
        let mut url = request.url().clone();
        let mut headers = prepare_headers(request);
        let mut body = request.body().to_vec();
        let mut followed = 0;

        loop {
            let raw = self
                .send_once(&client, &method, &url, &headers, &body, proxy)
                .await?;
            if !is_redirect(raw.status) || followed >= request.max_redirects() {
                return Ok(raw);
            }

            let next = raw
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| url.join(location).ok());
            let Some(next) = next else {
                return Err(CrawlError::InvalidResponseStatus {
                    url: url.to_string(),
                    status: raw.status,
                });
            };

            followed += 1;
            debug!(status = raw.status, from = %url, to = %next, followed, "following redirect");
            if matches!(raw.status, 301..=303) && method != Method::HEAD {
                method = Method::GET;
                body.clear();
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            url = next;
        }
    }

    async fn send_once(
        &self,
        client: &Client,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        proxy: Option<&Url>,
    ) -> Result<RawResponse, CrawlError> {
        if let Some(proxy) = proxy.filter(|proxy| needs_tunnel(proxy, url)) {
            return self.send_tunnelled(proxy, method, url, headers, body).await;
        }

        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if !body.is_empty() {
            builder = builder.body(body.to_vec());
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(&e, url, proxy))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&e, url, proxy))?;
        trace!(status, bytes = body.len(), "transport attempt complete");

        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    /// One attempt over a fresh CONNECT tunnel, bounded by the attempt timeout.
    async fn send_tunnelled(
        &self,
        proxy: &Url,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<RawResponse, CrawlError> {
        let attempt = async {
            let stream =
                tunnel::open(proxy, url, Duration::from_secs(CONNECT_TIMEOUT_SECS)).await?;
            tunnel::send(stream, proxy, method, url, headers, body).await
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                CrawlError::proxy_expired(proxy_addr(proxy), format!("no response within {limit:?}"))
            })?,
            None => attempt.await,
        }
    }

    /// Returns the cached client for `proxy`, building it on first use.
    fn client_for(&self, proxy: &Url) -> Result<Client, CrawlError> {
        // Re-validate: per-request proxies never went through the pool.
        crate::proxy::parse_proxy(proxy.as_str())?;
        if let Some(client) = self.proxied.get(proxy.as_str()) {
            return Ok(client.clone());
        }
        let client = Proxy::all(proxy.as_str())
            .and_then(|p| base_client_builder().proxy(p).build())
            .map_err(|e| CrawlError::invalid_proxy(proxy.as_str(), e.to_string()))?;
        debug!(proxy = %proxy, "built proxied client");
        Ok(self
            .proxied
            .entry(proxy.to_string())
            .or_insert(client)
            .clone())
    }
}

fn base_client_builder() -> ClientBuilder {
    Client::builder()
        .redirect(Policy::none())
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .gzip(true)
}

fn needs_tunnel(proxy: &Url, target: &Url) -> bool {
    matches!(proxy.scheme(), "http" | "https") && target.scheme() == "http"
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Copies the request headers and fills in transport defaults.
fn prepare_headers(request: &Request) -> HeaderMap {
    let mut headers = request.headers().clone();
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    }
    let has_body_method = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH
    );
    if has_body_method && !request.body().is_empty() && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
    }
    headers
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::context::Context;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn request(method: Method, url: &str) -> Request {
        Request::new(method, Url::parse(url).unwrap(), Context::default())
    }

    /// Returns a localhost URL nothing listens on.
    fn refused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_prepare_headers_defaults() {
        let req = request(Method::POST, "http://a.test/").with_body(b"a=1".to_vec(), None);
        let headers = prepare_headers(&req);
        assert_eq!(headers.get(ACCEPT).unwrap(), "*/*");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), FORM_CONTENT_TYPE);

        let get = prepare_headers(&request(Method::GET, "http://a.test/"));
        assert!(get.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_prepare_headers_keeps_explicit_values() {
        let mut req = request(Method::POST, "http://a.test/").with_body(b"{}".to_vec(), None);
        req.set_header("accept", "text/html");
        req.set_content_type("application/json");
        let headers = prepare_headers(&req);
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/html");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_execute_returns_status_headers_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/hello"))
            .and(header("accept", "*/*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-test", "1")
                    .set_body_string("hello world\n"),
            )
            .mount(&server)
            .await;

        let transport = Transport::new(None).unwrap();
        let raw = transport
            .execute(&request(Method::GET, &format!("{}/hello", server.uri())), None)
            .await
            .unwrap();
        assert_eq!(raw.status, 200);
        assert_eq!(raw.headers.get("x-test").unwrap(), "1");
        assert_eq!(raw.body, b"hello world\n");
    }

    #[tokio::test]
    async fn test_redirects_not_followed_by_default() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/redirect"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/target"))
            .mount(&server)
            .await;
        Mock::given(path("/target"))
            .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
            .mount(&server)
            .await;

        let transport = Transport::new(None).unwrap();
        let url = format!("{}/redirect", server.uri());
        let raw = transport.execute(&request(Method::GET, &url), None).await.unwrap();
        assert_eq!(raw.status, 301);

        let mut req = request(Method::GET, &url);
        req.allow_redirect(1);
        let raw = transport.execute(&req, None).await.unwrap();
        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, b"landed");
    }

    #[tokio::test]
    async fn test_see_other_switches_post_to_get() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(303).insert_header("location", "/done"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/done"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new(None).unwrap();
        let mut req = request(Method::POST, &format!("{}/submit", server.uri()))
            .with_body(b"a=1".to_vec(), None);
        req.allow_redirect(2);
        assert_eq!(transport.execute(&req, None).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_followed_redirect_without_location_is_invalid_status() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(302))
            .mount(&server)
            .await;

        let transport = Transport::new(None).unwrap();
        let mut req = request(Method::GET, &format!("{}/broken", server.uri()));
        req.allow_redirect(1);
        assert!(matches!(
            transport.execute(&req, None).await,
            Err(CrawlError::InvalidResponseStatus { status: 302, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_without_proxy() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = Transport::new(Some(Duration::from_millis(100))).unwrap();
        let req = request(Method::GET, &format!("{}/slow", server.uri()));
        assert!(matches!(
            transport.execute(&req, None).await,
            Err(CrawlError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_direct_connection_is_request_failed() {
        if crate::test_support::socket_guard::should_skip_socket_bound_test() {
            return;
        }
        let transport = Transport::new(None).unwrap();
        let req = request(Method::GET, &format!("http://{}/", refused_addr()));
        let error = transport.execute(&req, None).await.unwrap_err();
        assert!(matches!(error, CrawlError::RequestFailed { .. }), "{error:?}");
        assert!(error.evictable_proxy().is_none());
    }

    #[tokio::test]
    async fn test_refused_proxy_is_evictable() {
        if crate::test_support::socket_guard::should_skip_socket_bound_test() {
            return;
        }
        let addr = refused_addr();
        let proxy = Url::parse(&format!("http://{addr}")).unwrap();
        let transport = Transport::new(None).unwrap();
        let error = transport
            .execute(&request(Method::GET, "http://predator.test/ip"), Some(&proxy))
            .await
            .unwrap_err();
        assert_eq!(error.evictable_proxy(), Some(addr.as_str()), "{error:?}");
    }

    #[test]
    fn test_only_plain_http_targets_tunnel_through_http_proxies() {
        let http_proxy = Url::parse("http://10.0.0.1:3128").unwrap();
        let socks = Url::parse("socks5://10.0.0.1:1080").unwrap();
        let plain = Url::parse("http://a.test/").unwrap();
        let secure = Url::parse("https://a.test/").unwrap();
        assert!(needs_tunnel(&http_proxy, &plain));
        assert!(!needs_tunnel(&http_proxy, &secure));
        assert!(!needs_tunnel(&socks, &plain));
    }

    #[tokio::test]
    async fn test_silent_tunnel_proxy_expires() {
        if crate::test_support::socket_guard::should_skip_socket_bound_test() {
            return;
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let proxy = Url::parse(&format!("http://{addr}")).unwrap();
        let transport = Transport::new(Some(Duration::from_millis(100))).unwrap();
        let error = transport
            .execute(&request(Method::GET, "http://predator.test/ip"), Some(&proxy))
            .await
            .unwrap_err();
        assert!(matches!(error, CrawlError::ProxyExpired { .. }), "{error:?}");
        assert_eq!(error.evictable_proxy(), Some(addr.as_str()));
    }

    #[tokio::test]
    async fn test_proxy_with_unknown_scheme_rejected_at_dial() {
        let transport = Transport::new(None).unwrap();
        let proxy = Url::parse("ftp://10.0.0.1:21").unwrap();
        assert!(matches!(
            transport
                .execute(&request(Method::GET, "http://a.test/"), Some(&proxy))
                .await,
            Err(CrawlError::UnknownProtocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_proxied_client_is_cached() {
        let transport = Transport::new(None).unwrap();
        let proxy = Url::parse("http://10.0.0.1:3128").unwrap();
        transport.client_for(&proxy).unwrap();
        transport.client_for(&proxy).unwrap();
        assert_eq!(transport.proxied.len(), 1);
    }
}
