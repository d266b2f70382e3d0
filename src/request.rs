//! Outgoing request model.
//!
//! A [`Request`] is built by the crawler for every dispatch call and handed to
//! pre-request handlers as `&mut Request`; this is the only place user code can
//! change it. After the pipeline finishes it is owned by the resulting
//! [`Response`](crate::Response).

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::warn;
use url::Url;

use crate::context::Context;

/// Structured view of a request body, used to resolve body cache fields.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyMap {
    /// `application/x-www-form-urlencoded` fields.
    Form(BTreeMap<String, String>),
    /// Decoded JSON document.
    Json(serde_json::Value),
    /// Text parts of a multipart form.
    Multipart(BTreeMap<String, String>),
}

/// An HTTP request flowing through the crawler pipeline.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Vec<u8>,
    body_map: Option<BodyMap>,
    ctx: Context,
    id: u64,
    aborted: bool,
    retry_counter: u32,
    max_redirects: usize,
    proxy: Option<String>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("body_len", &self.body.len())
            .field("aborted", &self.aborted)
            .field("retry_counter", &self.retry_counter)
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Creates a request with an empty header map and no body.
    #[must_use]
    pub fn new(method: Method, url: Url, ctx: Context) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
            body_map: None,
            ctx,
            id: 0,
            aborted: false,
            retry_counter: 0,
            max_redirects: 0,
            proxy: None,
        }
    }

    /// Attaches a body and its structured form.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>, body_map: Option<BodyMap>) -> Self {
        self.body = body;
        self.body_map = body_map;
        self
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Absolute target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers (case-insensitive keys).
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Structured body used for fingerprinting, if any.
    #[must_use]
    pub fn body_map(&self) -> Option<&BodyMap> {
        self.body_map.as_ref()
    }

    /// The context shared with response handlers.
    #[must_use]
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Per-crawler sequence number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a pre-request handler aborted this request.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Number of retries performed so far.
    #[must_use]
    pub fn retry_counter(&self) -> u32 {
        self.retry_counter
    }

    /// Maximum redirects the transport may follow for this request.
    #[must_use]
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Proxy pinned to this request, bypassing the pool.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Sets several headers, replacing existing values.
    ///
    /// Invalid header names or values are skipped with a warning.
    pub fn set_headers<K, V>(&mut self, headers: impl IntoIterator<Item = (K, V)>)
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self.set_header(name.as_ref(), value.as_ref());
        }
    }

    /// Sets one header, replacing any existing value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(request_id = self.id, header = name, "skipping invalid header"),
        }
    }

    /// Sets the `Content-Type` header.
    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header(CONTENT_TYPE.as_str(), content_type);
    }

    /// Allows the transport to follow up to `max_redirects` redirects.
    pub fn allow_redirect(&mut self, max_redirects: usize) {
        self.max_redirects = max_redirects;
    }

    /// Stops the pipeline for this request without an error.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Routes this request through `proxy` instead of the crawler's pool.
    pub fn set_proxy(&mut self, proxy: impl Into<String>) {
        self.proxy = Some(proxy.into());
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_counter += 1;
    }
}
