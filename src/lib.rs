//! Predator Crawler Library
//!
//! An HTTP crawler: configure a reusable [`Crawler`], register lifecycle
//! handlers, and submit requests that flow through a pipeline of header
//! patching, fingerprinting, response-cache lookup, proxy selection,
//! transport, retry and handler dispatch.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`crawler`] - Client handle, builder, handlers and the request pipeline
//! - [`context`] - Key/value context shared by the handlers of one request
//! - [`fingerprint`] - Deterministic request fingerprints used as cache keys
//! - [`cache`] - Response cache trait with memory and SQLite backends
//! - [`proxy`] - Proxy pool with eviction and replenishment
//! - [`pool`] - Bounded worker pool running pipelines concurrently
//! - [`transport`] - reqwest-backed transport with manual redirects
//! - [`config`] / [`logging`] - JSON configuration and tracing setup

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod context;
pub mod crawler;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod html;
pub mod logging;
pub mod multipart;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod retry;
pub mod transport;
mod user_agent;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use cache::{Cache, CacheError, MemoryCache, SqliteCache};
pub use config::{CacheConfig, CrawlerConfig};
pub use context::{Context, ContextKind, ContextPool, Value};
pub use crawler::{
    CrawlStats, Crawler, CrawlerBuilder, HtmlHandler, JsonHandler, RequestHandler,
    ResponseHandler,
};
pub use db::{Database, DbError};
pub use error::CrawlError;
pub use fingerprint::{CacheField, CacheFieldKind, fingerprint};
pub use html::HtmlElement;
pub use logging::{LogConfig, LogSink};
pub use multipart::MultipartForm;
pub use pool::{PoolError, WorkerPool};
pub use proxy::ProxyPool;
pub use request::{BodyMap, Request};
pub use response::{RawResponse, Response};
pub use retry::RetryPolicy;
