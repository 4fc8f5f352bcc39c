//! Retrying reverse-proxy transport
//!
//! Forwards a request to an upstream, masking the cold-start window where a
//! freshly spawned backend has not yet bound its port. Transport errors on
//! idempotent requests are retried with capped exponential backoff until
//! the budget is spent; everything else fails fast with 502. Bodies of
//! non-idempotent requests are streamed untouched and never replayed.

use crate::error::{HttpResponse, NavigatorError};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Total time allowed for connect retries.
pub const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(3);

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Pooled upstream clients plus the retry budget.
pub struct RetryingProxy {
    /// Streams request bodies as-is; used for non-idempotent methods.
    streaming: Client<HttpConnector, Incoming>,
    /// Rebuilds requests from a buffered body so they can be retried.
    buffered: Client<HttpConnector, Full<Bytes>>,
    budget: Duration,
}

impl RetryingProxy {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_RETRY_BUDGET)
    }

    pub fn with_budget(budget: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let streaming = Client::builder(TokioExecutor::new()).build(connector.clone());
        let buffered = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            streaming,
            buffered,
            budget,
        }
    }

    /// Forward a request to `base` (scheme plus authority, e.g.
    /// `http://127.0.0.1:4001`), keeping the original path and query.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        base: &str,
    ) -> Result<HttpResponse, NavigatorError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{}{}", base, path_and_query)
            .parse()
            .map_err(|e| NavigatorError::UpstreamTransport(format!("bad target {}: {}", base, e)))?;

        self.forward_to_uri(req, uri).await
    }

    /// Forward a request to an exact URI (replay fallback URLs carry their
    /// own path and query).
    pub async fn forward_to_uri(
        &self,
        req: Request<Incoming>,
        uri: Uri,
    ) -> Result<HttpResponse, NavigatorError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = uri.clone();

        if retryable_method(&parts.method) {
            let bytes = body
                .collect()
                .await
                .map_err(|e| NavigatorError::UpstreamTransport(format!("reading body: {}", e)))?
                .to_bytes();
            self.send_buffered(parts.method, uri, parts.headers, bytes).await
        } else {
            // The body may already be partially consumed upstream; one
            // attempt only.
            let request = Request::from_parts(parts, body);
            match self.streaming.request(request).await {
                Ok(response) => Ok(response.map(|b| b.boxed())),
                Err(e) => {
                    warn!(target = %uri, error = %e, "Upstream request failed");
                    Err(NavigatorError::UpstreamTransport(e.to_string()))
                }
            }
        }
    }

    /// Bounded retry loop for requests whose body we hold in full.
    async fn send_buffered(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<HttpResponse, NavigatorError> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let mut request = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(Full::new(body.clone()))
                .map_err(|e| NavigatorError::UpstreamTransport(e.to_string()))?;
            *request.headers_mut() = headers.clone();

            match self.buffered.request(request).await {
                Ok(response) => {
                    if attempts > 1 {
                        debug!(target = %uri, attempts, "Upstream reachable after retry");
                    }
                    return Ok(response.map(|b| b.boxed()));
                }
                Err(e) if e.is_connect() && start.elapsed() < self.budget => {
                    debug!(target = %uri, attempt = attempts, error = %e, "Retrying upstream connect");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    warn!(target = %uri, attempts, error = %e, "Upstream unreachable, giving up");
                    return Err(NavigatorError::UpstreamTransport(e.to_string()));
                }
            }
        }
    }
}

impl Default for RetryingProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Only requests that are safe to re-send get the retry loop.
fn retryable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// Add the standard forwarded headers and a request ID.
///
/// Existing values win: an upstream proxy in front of us already recorded
/// the original client.
pub fn apply_forward_headers<B>(req: &mut Request<B>, client_addr: SocketAddr) {
    let host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();

    if !headers.contains_key(X_FORWARDED_FOR) {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CANNED: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

    async fn oneshot_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(CANNED.as_bytes()).await;
            }
        });
        port
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_buffered_forward() {
        let port = oneshot_server().await;
        let proxy = RetryingProxy::new();

        let uri: Uri = format!("http://127.0.0.1:{}/hello", port).parse().unwrap();
        let resp = proxy
            .send_buffered(Method::GET, uri, HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_budget() {
        let port = free_port();
        let proxy = RetryingProxy::with_budget(Duration::from_millis(250));

        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        let started = Instant::now();
        let result = proxy
            .send_buffered(Method::GET, uri, HeaderMap::new(), Bytes::new())
            .await;
        assert!(matches!(result, Err(NavigatorError::UpstreamTransport(_))));
        // Budget spent on retries before giving up.
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_retry_masks_late_bind() {
        let port = free_port();
        let proxy = RetryingProxy::new();

        // The upstream binds only after a delay; the retry loop should hide it.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(CANNED.as_bytes()).await;
            }
        });

        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        let resp = proxy
            .send_buffered(Method::GET, uri, HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[test]
    fn test_retryable_methods() {
        assert!(retryable_method(&Method::GET));
        assert!(retryable_method(&Method::HEAD));
        assert!(!retryable_method(&Method::POST));
        assert!(!retryable_method(&Method::PUT));
        assert!(!retryable_method(&Method::DELETE));
    }

    #[test]
    fn test_forward_headers_inserted() {
        let mut req = Request::builder()
            .uri("/x")
            .header(hyper::header::HOST, "example.test")
            .body(())
            .unwrap();
        let addr: SocketAddr = "203.0.113.9:4711".parse().unwrap();

        apply_forward_headers(&mut req, addr);

        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "203.0.113.9");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "example.test");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
        assert!(req.headers().contains_key(X_REQUEST_ID));
    }

    #[test]
    fn test_forward_headers_preserved() {
        let mut req = Request::builder()
            .uri("/x")
            .header(X_FORWARDED_FOR, "198.51.100.7")
            .header(X_FORWARDED_PROTO, "https")
            .header(X_REQUEST_ID, "fixed-id")
            .body(())
            .unwrap();
        let addr: SocketAddr = "203.0.113.9:4711".parse().unwrap();

        apply_forward_headers(&mut req, addr);

        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "198.51.100.7");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(req.headers().get(X_REQUEST_ID).unwrap(), "fixed-id");
    }
}
