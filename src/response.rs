//! Response model and its cached record encoding.
//!
//! Responses are produced by the transport or rebuilt from a cached record. A
//! response owns the [`Request`] that produced it, which in turn owns the
//! [`Context`], so handlers reach everything from one value.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::request::Request;

/// Wire-independent pieces of an HTTP response as returned by the transport.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

/// An HTTP response delivered to response, HTML and JSON handlers.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    from_cache: bool,
    request: Request,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("from_cache", &self.from_cache)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub(crate) fn new(raw: RawResponse, request: Request, from_cache: bool) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            from_cache,
            request,
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the response was synthesized from the cache.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// The request that produced this response.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The context written by pre-request handlers.
    #[must_use]
    pub fn ctx(&self) -> &Context {
        self.request.ctx()
    }

    /// Value of the `Content-Type` header, or an empty string.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    /// Whether the body is declared as HTML.
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type().contains("html")
    }

    /// Whether the body is declared as JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type().contains("json")
    }

    /// Whether this response may be written to the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(self.status, 200 | 201)
    }

    /// Serializes status, headers and body into a cache record payload.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if serialization fails.
    pub fn to_cache_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.headers {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        serde_json::to_vec(&CachedResponse {
            status_code: self.status,
            body: STANDARD.encode(&self.body),
            headers,
        })
    }

    pub(crate) fn into_request(self) -> Request {
        self.request
    }
}

/// JSON payload stored for a cached response.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CachedResponse {
    pub(crate) status_code: u16,
    pub(crate) body: String,
    #[serde(default)]
    pub(crate) headers: BTreeMap<String, Vec<String>>,
}

/// Errors decoding a cache record into a response.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The payload was not a valid record.
    #[error("malformed cached response: {0}")]
    Json(#[from] serde_json::Error),
    /// The body was not valid base64.
    #[error("malformed cached body: {0}")]
    Body(#[from] base64::DecodeError),
}

/// Decodes a cache record payload into raw response parts.
///
/// Headers that are no longer valid are dropped.
///
/// # Errors
///
/// Returns [`RecordError`] if the payload or its body cannot be decoded.
pub fn raw_from_cache_bytes(bytes: &[u8]) -> Result<RawResponse, RecordError> {
    let record: CachedResponse = serde_json::from_slice(bytes)?;
    let body = STANDARD.decode(record.body.as_bytes())?;
    let mut headers = HeaderMap::new();
    for (name, values) in record.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), value);
            }
        }
    }
    Ok(RawResponse {
        status: record.status_code,
        headers,
        body,
    })
}
