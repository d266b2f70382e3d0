use std::error::Error as _;

use url::Url;

use crate::error::CrawlError;
use crate::proxy::proxy_addr;

/// Flattens a reqwest error and its sources into one message.
pub(super) fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Converts a transport failure into a typed crawl error.
///
/// Through a proxy, timeouts are `ProxyExpired`, refused tunnels are
/// `ProxyUnableToConnect` and other dial or read failures are `ProxyInvalid`;
/// all three carry the proxy's `host:port` so the pipeline can evict it.
pub(super) fn map_transport_error(
    error: &reqwest::Error,
    target: &Url,
    proxy: Option<&Url>,
) -> CrawlError {
    let message = error_chain(error);
    let Some(proxy) = proxy else {
        if error.is_timeout() {
            return CrawlError::timeout(target.as_str());
        }
        return CrawlError::request_failed(target.as_str(), message);
    };

    if error.is_builder() || error.is_decode() {
        return CrawlError::request_failed(target.as_str(), message);
    }
    let addr = proxy_addr(proxy);
    if error.is_timeout() {
        return CrawlError::proxy_expired(addr, message);
    }
    if message.to_ascii_lowercase().contains("tunnel") {
        return CrawlError::ProxyUnableToConnect {
            proxy: addr,
            target: format!(
                "{}:{}",
                target.host_str().unwrap_or_default(),
                target.port_or_known_default().unwrap_or(443)
            ),
        };
    }
    CrawlError::proxy_invalid(addr, message)
}
