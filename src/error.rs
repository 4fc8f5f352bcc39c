//! Error taxonomy and HTTP error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::fmt;

/// Response body type used throughout the request pipeline.
pub type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Errors produced by the routing and backend-lifecycle core.
#[derive(Debug)]
pub enum NavigatorError {
    /// Configuration file could not be parsed. Fatal at startup, ignored on reload.
    ConfigParse(String),
    /// htpasswd file could not be loaded. Existing auth is retained.
    AuthLoad(String),
    /// PID file could not be read or removed.
    PidfileIo(String),
    /// No free port in the configured range.
    PortExhausted { min: u16, max: u16 },
    /// Backend subprocess failed to spawn.
    BackendSpawn(String),
    /// Backend did not become ready within the acquire deadline.
    StartupTimeout(String),
    /// Transport failure talking to an upstream, after retries.
    UpstreamTransport(String),
    /// Request already carries the replay retry marker.
    ReplayLoop,
    /// Platform machines API call failed. Logged only.
    PlatformApi(String),
}

impl NavigatorError {
    /// HTTP status this error maps to when it reaches a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            NavigatorError::ConfigParse(_)
            | NavigatorError::AuthLoad(_)
            | NavigatorError::PidfileIo(_)
            | NavigatorError::PortExhausted { .. }
            | NavigatorError::BackendSpawn(_)
            | NavigatorError::StartupTimeout(_)
            | NavigatorError::PlatformApi(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NavigatorError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            NavigatorError::ReplayLoop => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short client-facing message. Internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            NavigatorError::BackendSpawn(_)
            | NavigatorError::StartupTimeout(_)
            | NavigatorError::PortExhausted { .. }
            | NavigatorError::PidfileIo(_) => "Failed to start application",
            NavigatorError::UpstreamTransport(_) => "Bad Gateway",
            NavigatorError::ReplayLoop => "Service Unavailable",
            NavigatorError::ConfigParse(_)
            | NavigatorError::AuthLoad(_)
            | NavigatorError::PlatformApi(_) => "Internal Server Error",
        }
    }
}

impl fmt::Display for NavigatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigatorError::ConfigParse(m) => write!(f, "config parse error: {}", m),
            NavigatorError::AuthLoad(m) => write!(f, "auth load error: {}", m),
            NavigatorError::PidfileIo(m) => write!(f, "pid file error: {}", m),
            NavigatorError::PortExhausted { min, max } => {
                write!(f, "no available ports in range {}-{}", min, max)
            }
            NavigatorError::BackendSpawn(m) => write!(f, "backend spawn failed: {}", m),
            NavigatorError::StartupTimeout(m) => {
                write!(f, "timeout waiting for backend {} to start", m)
            }
            NavigatorError::UpstreamTransport(m) => write!(f, "upstream transport error: {}", m),
            NavigatorError::ReplayLoop => write!(f, "replay retry header already present"),
            NavigatorError::PlatformApi(m) => write!(f, "platform API error: {}", m),
        }
    }
}

impl std::error::Error for NavigatorError {}

/// Build a response body from a static or owned string.
pub fn text_body(text: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// Build the short client-facing response for an error.
pub fn error_response(err: &NavigatorError) -> HttpResponse {
    plain_response(err.status_code(), err.public_message())
}

/// Build a plain-text response with the given status.
pub fn plain_response(status: StatusCode, message: &'static str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(text_body(message))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            NavigatorError::StartupTimeout("/shop/".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            NavigatorError::UpstreamTransport("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            NavigatorError::ReplayLoop.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            NavigatorError::PortExhausted { min: 4000, max: 4100 }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = NavigatorError::BackendSpawn("No such file or directory".into());
        assert_eq!(err.public_message(), "Failed to start application");
        assert!(err.to_string().contains("No such file"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(&NavigatorError::UpstreamTransport("reset".into()));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
