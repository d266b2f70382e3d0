//! Deterministic request fingerprints used as cache keys.
//!
//! A fingerprint is the lowercase hex SHA-1 of a compact JSON object holding
//! the method, the URL with its query re-encoded in sorted key order, and the
//! values selected by the registered [`CacheField`]s. Object keys are sorted,
//! so field registration order never matters.
//!
//! # Example
//!
//! ```
//! use predator::context::Context;
//! use predator::fingerprint::{CacheField, fingerprint};
//! use predator::Request;
//! use reqwest::Method;
//! use url::Url;
//!
//! let a = Request::new(Method::GET, Url::parse("http://a.test/?y=2&x=1").unwrap(), Context::default());
//! let b = Request::new(Method::GET, Url::parse("http://a.test/?x=1&y=2").unwrap(), Context::default());
//! let fields = [CacheField::query("x")];
//! assert_eq!(fingerprint(&a, &fields).unwrap(), fingerprint(&b, &fields).unwrap());
//! ```

use std::fmt;
use std::sync::Arc;

use reqwest::Method;
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::CrawlError;
use crate::request::{BodyMap, Request};

/// Value normalizer applied to a cache field before hashing.
pub type Normalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Where a cache field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFieldKind {
    /// A URL query parameter.
    Query,
    /// A form, multipart or JSON body parameter.
    Body,
}

impl CacheFieldKind {
    /// Numeric code used to prefix fingerprint keys.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Query => 0,
            Self::Body => 1,
        }
    }

    fn location(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Body => "body",
        }
    }
}

/// A request parameter that contributes to the fingerprint.
#[derive(Clone)]
pub struct CacheField {
    kind: CacheFieldKind,
    name: String,
    normalizer: Option<Normalizer>,
}

impl fmt::Debug for CacheField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheField")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("normalized", &self.normalizer.is_some())
            .finish()
    }
}

impl CacheField {
    /// A query-string parameter.
    #[must_use]
    pub fn query(name: impl Into<String>) -> Self {
        Self {
            kind: CacheFieldKind::Query,
            name: name.into(),
            normalizer: None,
        }
    }

    /// A body parameter. For JSON bodies `name` is a dotted path (`user.id`,
    /// `items.0.sku`).
    #[must_use]
    pub fn body(name: impl Into<String>) -> Self {
        Self {
            kind: CacheFieldKind::Body,
            name: name.into(),
            normalizer: None,
        }
    }

    /// Applies `normalizer` to the value before hashing.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    /// Field kind.
    #[must_use]
    pub fn kind(&self) -> CacheFieldKind {
        self.kind
    }

    /// Field name or dotted path.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        format!("{}-{}", self.kind.code(), self.name)
    }

    fn normalize(&self, value: String) -> String {
        match &self.normalizer {
            Some(normalize) => normalize(&value),
            None => value,
        }
    }
}

/// Rebuilds `url` with its query parameters sorted by key.
///
/// Values of a repeated key keep their relative order. URLs without a query are
/// returned unchanged.
#[must_use]
pub fn canonical_url(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = url.clone();
    if pairs.is_empty() {
        canonical.set_query(None);
    } else {
        canonical.query_pairs_mut().clear().extend_pairs(pairs);
    }
    canonical.to_string()
}

/// Computes the fingerprint of `request` given the registered cache fields.
///
/// # Errors
///
/// - [`CrawlError::CacheFieldTypeNotAllowed`] for a body field on a GET request.
/// - [`CrawlError::CacheFieldMissing`] when a field is absent from the request.
pub fn fingerprint(request: &Request, fields: &[CacheField]) -> Result<String, CrawlError> {
    let mut object = serde_json::Map::new();
    object.insert(
        "method".to_string(),
        serde_json::Value::String(request.method().as_str().to_string()),
    );
    object.insert(
        "url".to_string(),
        serde_json::Value::String(canonical_url(request.url())),
    );

    for field in fields {
        let value = match field.kind {
            CacheFieldKind::Query => lookup_query(request.url(), &field.name),
            CacheFieldKind::Body => {
                if request.method() == Method::GET {
                    return Err(CrawlError::CacheFieldTypeNotAllowed {
                        field: field.name.clone(),
                        method: request.method().to_string(),
                    });
                }
                request
                    .body_map()
                    .and_then(|body| lookup_body(body, &field.name))
            }
        }
        .ok_or_else(|| CrawlError::cache_field_missing(field.name.clone(), field.kind.location()))?;

        object.insert(field.key(), serde_json::Value::String(field.normalize(value)));
    }

    // serde_json::Map is ordered by key, which gives the sorted serialization.
    let payload = serde_json::Value::Object(object).to_string();
    Ok(hex::encode(Sha1::digest(payload.as_bytes())))
}

fn lookup_query(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn lookup_body(body: &BodyMap, name: &str) -> Option<String> {
    match body {
        BodyMap::Form(map) | BodyMap::Multipart(map) => map.get(name).cloned(),
        BodyMap::Json(document) => lookup_json_path(document, name),
    }
}

/// Descends `document` along a dotted path. Numeric segments index arrays.
fn lookup_json_path(document: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
