//! Handler traits and the crawler's handler registries.
//!
//! Every handler receives the [`Crawler`] that runs it, so a handler can
//! dispatch follow-up requests without holding a reference back to its owner.
//! Plain closures implement the traits through blanket impls; implement a
//! trait directly when the handler needs to `.await`.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use predator::{Crawler, HtmlElement, HtmlHandler, Response};
//!
//! struct FollowLinks;
//!
//! #[async_trait]
//! impl HtmlHandler for FollowLinks {
//!     async fn on_element(&self, crawler: &Crawler, element: &HtmlElement, _response: &Response) {
//!         if let Some(href) = element.attr("href") {
//!             if let Err(error) = crawler.get(href).await {
//!                 tracing::warn!(%error, "follow-up request failed");
//!             }
//!         }
//!     }
//! }
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use scraper::Selector;

use super::Crawler;
use crate::html::HtmlElement;
use crate::request::Request;
use crate::response::Response;

/// Runs before the cache lookup and transport; may mutate or abort the request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Called once per request in registration order.
    async fn on_request(&self, crawler: &Crawler, request: &mut Request);
}

/// Runs for every response, fetched or cached.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Called once per response in registration order.
    async fn on_response(&self, crawler: &Crawler, response: &Response);
}

/// Runs once per element matching the handler's selector in an HTML response.
#[async_trait]
pub trait HtmlHandler: Send + Sync {
    /// Called in document order; `element.index()` counts from zero.
    async fn on_element(&self, crawler: &Crawler, element: &HtmlElement, response: &Response);
}

/// Runs with the decoded body of a JSON response.
#[async_trait]
pub trait JsonHandler: Send + Sync {
    /// Called once per response whose body parsed as JSON.
    async fn on_json(&self, crawler: &Crawler, json: &serde_json::Value, response: &Response);
}

#[async_trait]
impl<F> RequestHandler for F
where
    F: Fn(&Crawler, &mut Request) + Send + Sync,
{
    async fn on_request(&self, crawler: &Crawler, request: &mut Request) {
        self(crawler, request);
    }
}

#[async_trait]
impl<F> ResponseHandler for F
where
    F: Fn(&Crawler, &Response) + Send + Sync,
{
    async fn on_response(&self, crawler: &Crawler, response: &Response) {
        self(crawler, response);
    }
}

#[async_trait]
impl<F> HtmlHandler for F
where
    F: Fn(&Crawler, &HtmlElement, &Response) + Send + Sync,
{
    async fn on_element(&self, crawler: &Crawler, element: &HtmlElement, response: &Response) {
        self(crawler, element, response);
    }
}

#[async_trait]
impl<F> JsonHandler for F
where
    F: Fn(&Crawler, &serde_json::Value, &Response) + Send + Sync,
{
    async fn on_json(&self, crawler: &Crawler, json: &serde_json::Value, response: &Response) {
        self(crawler, json, response);
    }
}

pub(crate) type HtmlEntry = (Selector, Arc<dyn HtmlHandler>);
pub(crate) type JsonEntry = (bool, Arc<dyn JsonHandler>);

/// Handler lists behind read-write locks.
///
/// Registration takes the write lock; the pipeline clones a snapshot under the
/// read lock so no lock is held while handlers run.
#[derive(Default)]
pub(crate) struct Handlers {
    request: RwLock<Vec<Arc<dyn RequestHandler>>>,
    response: RwLock<Vec<Arc<dyn ResponseHandler>>>,
    html: RwLock<Vec<HtmlEntry>>,
    json: RwLock<Vec<JsonEntry>>,
}

fn push<T>(lock: &RwLock<Vec<T>>, entry: T) {
    lock.write().unwrap_or_else(PoisonError::into_inner).push(entry);
}

fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

impl Handlers {
    pub(crate) fn add_request(&self, handler: Arc<dyn RequestHandler>) {
        push(&self.request, handler);
    }

    pub(crate) fn add_response(&self, handler: Arc<dyn ResponseHandler>) {
        push(&self.response, handler);
    }

    pub(crate) fn add_html(&self, selector: Selector, handler: Arc<dyn HtmlHandler>) {
        push(&self.html, (selector, handler));
    }

    pub(crate) fn add_json(&self, strict: bool, handler: Arc<dyn JsonHandler>) {
        push(&self.json, (strict, handler));
    }

    pub(crate) fn request(&self) -> Vec<Arc<dyn RequestHandler>> {
        snapshot(&self.request)
    }

    pub(crate) fn response(&self) -> Vec<Arc<dyn ResponseHandler>> {
        snapshot(&self.response)
    }

    pub(crate) fn html(&self) -> Vec<HtmlEntry> {
        snapshot(&self.html)
    }

    pub(crate) fn json(&self) -> Vec<JsonEntry> {
        snapshot(&self.json)
    }
}
