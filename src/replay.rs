//! Replay decision
//!
//! A matched fly-replay rule either answers with a replay envelope — asking
//! the platform router to re-deliver the request to another region, app, or
//! machine — or, when the body is too large to replay, proxies the request
//! to the target's internal address instead. A request that already carries
//! the retry marker has looped back; it gets the maintenance page.

use crate::config::{Config, ReplayTarget};
use crate::error::{error_response, text_body, HttpResponse, NavigatorError};
use crate::proxy::RetryingProxy;
use crate::static_files;
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde_json::json;
use tracing::{debug, warn};

/// MIME type of the replay envelope.
pub const REPLAY_CONTENT_TYPE: &str = "application/vnd.fly.replay+json";

/// Marker injected into replayed requests; seeing it again means a loop.
pub const RETRY_HEADER: &str = "x-navigator-retry";

/// Bodies at or above this size never travel through a replay.
const MAX_REPLAY_BODY: u64 = 1_000_000;

/// Outcome of evaluating a matched replay rule.
pub enum ReplayOutcome {
    /// Terminal response (envelope, maintenance page, or fallback result).
    Response(HttpResponse),
    /// Replay impossible here; the pipeline continues with the request.
    Continue(Request<Incoming>),
}

/// Evaluate a matched replay rule against a request.
pub async fn apply(
    config: &Config,
    target: &ReplayTarget,
    status: u16,
    req: Request<Incoming>,
    proxy: &RetryingProxy,
) -> ReplayOutcome {
    let use_replay = should_use_replay(req.method(), req.headers())
        && target_resolvable(target, config.listen).await;

    if use_replay {
        if has_retry_marker(req.headers()) {
            let err = NavigatorError::ReplayLoop;
            warn!(uri = %req.uri(), error = %err, "Serving maintenance page");
            let mut response = static_files::maintenance_page(config).await;
            *response.status_mut() = err.status_code();
            return ReplayOutcome::Response(response);
        }
        debug!(uri = %req.uri(), ?target, "Emitting replay envelope");
        return ReplayOutcome::Response(envelope_response(target, status));
    }

    // Fallback: reverse-proxy to the target's internal address ourselves.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let Some(url) = fallback_url(target, config.listen, &path_and_query) else {
        warn!("FLY_APP_NAME not set, cannot build replay fallback URL");
        return ReplayOutcome::Continue(req);
    };
    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(url = %url, error = %e, "Invalid replay fallback URL");
            return ReplayOutcome::Continue(req);
        }
    };

    debug!(target = %uri, "Replay fallback via internal reverse proxy");
    match proxy.forward_to_uri(req, uri).await {
        Ok(response) => ReplayOutcome::Response(response),
        Err(e) => ReplayOutcome::Response(error_response(&e)),
    }
}

/// Replay is only safe for bodies the platform will buffer: small known
/// sizes, or bodyless methods when the length is unknown.
pub fn should_use_replay(method: &Method, headers: &HeaderMap) -> bool {
    let content_length = headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match content_length {
        Some(length) => length < MAX_REPLAY_BODY,
        None => !matches!(*method, Method::POST | Method::PUT | Method::PATCH),
    }
}

/// Whether the request already went through a replay.
pub fn has_retry_marker(headers: &HeaderMap) -> bool {
    headers
        .get(RETRY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Optional pre-replay liveness gate: when `ENABLE_DNS_CHECK` is set, a
/// target whose internal name does not resolve falls back to the reverse
/// proxy instead of bouncing the request.
async fn target_resolvable(target: &ReplayTarget, port: u16) -> bool {
    if std::env::var("ENABLE_DNS_CHECK").map(|v| v == "true") != Ok(true) {
        return true;
    }
    let Some(host) = fallback_host(target) else {
        return true;
    };
    let result = tokio::net::lookup_host((host.as_str(), port)).await;
    result.is_ok()
}

fn envelope_response(target: &ReplayTarget, status: u16) -> HttpResponse {
    let body = envelope_json(target).to_string();
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::TEMPORARY_REDIRECT))
        .header(hyper::header::CONTENT_TYPE, REPLAY_CONTENT_TYPE)
        .body(text_body(body))
        .expect("static response parts are valid")
}

/// The envelope instructs the platform router where to re-deliver the
/// request and marks it so a second arrival is recognizable.
fn envelope_json(target: &ReplayTarget) -> serde_json::Value {
    let transform = json!({
        "set_headers": [{"name": "X-Navigator-Retry", "value": "true"}]
    });

    match target {
        ReplayTarget::Region(region) => json!({
            "region": format!("{},any", region),
            "transform": transform,
        }),
        ReplayTarget::App(app) => json!({
            "app": app,
            "transform": transform,
        }),
        ReplayTarget::Machine { id, app } => json!({
            "app": app,
            "prefer_instance": id,
            "transform": transform,
        }),
    }
}

/// Internal hostname a target is reachable at, when one can be built.
fn fallback_host(target: &ReplayTarget) -> Option<String> {
    match target {
        ReplayTarget::Region(region) => {
            let app = std::env::var("FLY_APP_NAME").ok()?;
            Some(format!("{}.{}.internal", region, app))
        }
        ReplayTarget::App(app) => Some(format!("{}.internal", app)),
        ReplayTarget::Machine { id, app } => Some(format!("{}.vm.{}.internal", id, app)),
    }
}

fn fallback_url(target: &ReplayTarget, port: u16, path_and_query: &str) -> Option<String> {
    let host = fallback_host(target)?;
    Some(format!("http://{}:{}{}", host, port, path_and_query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers_with_length(length: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_LENGTH,
            HeaderValue::from_str(length).unwrap(),
        );
        headers
    }

    #[test]
    fn test_replay_for_small_known_body() {
        let headers = headers_with_length("512");
        assert!(should_use_replay(&Method::POST, &headers));
        assert!(should_use_replay(&Method::GET, &headers));
    }

    #[test]
    fn test_fallback_for_large_body() {
        let headers = headers_with_length("1000000");
        assert!(!should_use_replay(&Method::GET, &headers));
        let headers = headers_with_length("999999");
        assert!(should_use_replay(&Method::GET, &headers));
    }

    #[test]
    fn test_fallback_for_unknown_length_mutations() {
        let headers = HeaderMap::new();
        assert!(!should_use_replay(&Method::POST, &headers));
        assert!(!should_use_replay(&Method::PUT, &headers));
        assert!(!should_use_replay(&Method::PATCH, &headers));
        assert!(should_use_replay(&Method::GET, &headers));
        assert!(should_use_replay(&Method::HEAD, &headers));
        assert!(should_use_replay(&Method::DELETE, &headers));
    }

    #[test]
    fn test_retry_marker() {
        let mut headers = HeaderMap::new();
        assert!(!has_retry_marker(&headers));
        headers.insert(RETRY_HEADER, HeaderValue::from_static("true"));
        assert!(has_retry_marker(&headers));
        headers.insert(RETRY_HEADER, HeaderValue::from_static("false"));
        assert!(!has_retry_marker(&headers));
    }

    #[test]
    fn test_region_envelope() {
        let value = envelope_json(&ReplayTarget::Region("fra".to_string()));
        assert_eq!(value["region"], "fra,any");
        assert_eq!(
            value["transform"]["set_headers"][0]["name"],
            "X-Navigator-Retry"
        );
        assert_eq!(value["transform"]["set_headers"][0]["value"], "true");
    }

    #[test]
    fn test_app_envelope() {
        let value = envelope_json(&ReplayTarget::App("smooth-pdf".to_string()));
        assert_eq!(value["app"], "smooth-pdf");
        assert!(value.get("region").is_none());
    }

    #[test]
    fn test_machine_envelope() {
        let value = envelope_json(&ReplayTarget::Machine {
            id: "148e21ea7".to_string(),
            app: "smooth-pdf".to_string(),
        });
        assert_eq!(value["app"], "smooth-pdf");
        assert_eq!(value["prefer_instance"], "148e21ea7");
    }

    #[test]
    fn test_envelope_response_shape() {
        let resp = envelope_response(&ReplayTarget::Region("fra".to_string()), 307);
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            REPLAY_CONTENT_TYPE
        );
    }

    #[test]
    fn test_fallback_urls() {
        // App and machine targets do not depend on FLY_APP_NAME.
        assert_eq!(
            fallback_url(&ReplayTarget::App("pdf".to_string()), 3000, "/a?b=1"),
            Some("http://pdf.internal:3000/a?b=1".to_string())
        );
        assert_eq!(
            fallback_url(
                &ReplayTarget::Machine {
                    id: "m1".to_string(),
                    app: "pdf".to_string(),
                },
                8080,
                "/x"
            ),
            Some("http://m1.vm.pdf.internal:8080/x".to_string())
        );
    }
}
