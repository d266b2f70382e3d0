//! CONNECT tunnels through HTTP(S) proxies for plain-HTTP targets.
//!
//! The proxy is dialed over TCP, asked to `CONNECT host:port`, and the request
//! is then written in origin form over the upgraded stream. Anything that goes
//! wrong before the origin answers is blamed on the proxy.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{HOST, HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use hyper::upgrade::Upgraded;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::{Position, Url};

use crate::error::CrawlError;
use crate::proxy::proxy_addr;
use crate::response::RawResponse;

/// `host:port` of the target, as sent in the CONNECT line.
fn target_authority(target: &Url) -> String {
    format!(
        "{}:{}",
        target.host_str().unwrap_or_default(),
        target.port_or_known_default().unwrap_or(80)
    )
}

/// `Basic` credentials from the proxy URL's userinfo, if any.
fn basic_credentials(proxy: &Url) -> Option<HeaderValue> {
    if proxy.username().is_empty() {
        return None;
    }
    let pair = format!("{}:{}", proxy.username(), proxy.password().unwrap_or_default());
    HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(pair))).ok()
}

/// Opens a tunnel to `target` through `proxy`.
///
/// # Errors
///
/// - `ProxyExpired` if the dial exceeds `connect_timeout`
/// - `ProxyInvalid` for dial or handshake failures
/// - `ProxyUnableToConnect` when the proxy answers CONNECT with anything but 200
pub(super) async fn open(
    proxy: &Url,
    target: &Url,
    connect_timeout: Duration,
) -> Result<Upgraded, CrawlError> {
    let addr = proxy_addr(proxy);
    let authority = target_authority(target);

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| CrawlError::proxy_expired(&addr, "connect timed out"))?
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?;
    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            trace!(%error, "proxy connection closed");
        }
    });

    let mut connect = hyper::Request::builder()
        .method(Method::CONNECT)
        .uri(authority.as_str())
        .header(HOST, authority.as_str());
    if let Some(credentials) = basic_credentials(proxy) {
        connect = connect.header(PROXY_AUTHORIZATION, credentials);
    }
    let connect = connect
        .body(Empty::<Bytes>::new())
        .map_err(|e| CrawlError::request_failed(target.as_str(), e.to_string()))?;

    let response = sender
        .send_request(connect)
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?;
    if response.status() != StatusCode::OK {
        debug!(proxy = %addr, status = %response.status(), "proxy refused CONNECT");
        return Err(CrawlError::ProxyUnableToConnect {
            proxy: addr,
            target: authority,
        });
    }
    hyper::upgrade::on(response)
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))
}

/// Sends one request over an open tunnel and reads the whole response.
///
/// # Errors
///
/// `ProxyInvalid` if the exchange fails; the proxy owns the stream.
pub(super) async fn send(
    tunnel: Upgraded,
    proxy: &Url,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<RawResponse, CrawlError> {
    let addr = proxy_addr(proxy);
    let (mut sender, conn) = http1::handshake(tunnel)
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            trace!(%error, "tunnel connection closed");
        }
    });

    let mut request = hyper::Request::builder()
        .method(method.clone())
        .uri(&url[Position::BeforePath..Position::AfterQuery])
        .body(Full::new(Bytes::copy_from_slice(body)))
        .map_err(|e| CrawlError::request_failed(url.as_str(), e.to_string()))?;
    request.headers_mut().extend(headers.clone());
    if !request.headers().contains_key(HOST) {
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            request.headers_mut().insert(HOST, value);
        }
    }

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| CrawlError::proxy_invalid(&addr, e.to_string()))?
        .to_bytes();
    trace!(status, bytes = body.len(), "tunnelled attempt complete");

    Ok(RawResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}
