//! Basic authentication against an htpasswd file
//!
//! The password check itself is delegated to the htpasswd parser; this
//! module owns loading, the public-path exclusion rules, and the 401
//! challenge. Paths are excluded from auth by exact match, `*.ext` suffix
//! glob, general glob, trailing-slash prefix, or a compiled regex pattern.

use crate::config::AuthSettings;
use crate::error::{text_body, HttpResponse, NavigatorError};
use base64::Engine;
use htpasswd_verify::Htpasswd;
use hyper::{Response, StatusCode};
use tracing::debug;

/// Loaded htpasswd credentials plus the challenge realm.
pub struct BasicAuth {
    contents: String,
    realm: String,
}

impl BasicAuth {
    /// Load credentials from the configured htpasswd file.
    ///
    /// Returns `None` when auth is disabled or no file is configured.
    pub fn load(settings: &AuthSettings) -> Result<Option<Self>, NavigatorError> {
        if !settings.enabled {
            return Ok(None);
        }
        let path = match settings.htpasswd {
            Some(ref path) => path,
            None => return Ok(None),
        };

        let contents = std::fs::read_to_string(path).map_err(|e| {
            NavigatorError::AuthLoad(format!("{}: {}", path.display(), e))
        })?;

        Ok(Some(Self {
            contents,
            realm: settings.realm.clone(),
        }))
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// `realm: off` disables the auth step entirely.
    pub fn realm_off(&self) -> bool {
        self.realm == "off"
    }

    /// Check an `Authorization` header value against the htpasswd file.
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some((user, pass)) = decode_basic(authorization) else {
            return false;
        };
        Htpasswd::from(self.contents.as_str()).check(&user, &pass)
    }

    /// 401 response carrying the Basic challenge.
    pub fn challenge(&self) -> HttpResponse {
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                hyper::header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{}\"", self.realm),
            )
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text_body("Unauthorized"))
            .expect("static response parts are valid")
    }
}

/// Decode `Basic <base64(user:pass)>` into its parts.
fn decode_basic(authorization: Option<&str>) -> Option<(String, String)> {
    let value = authorization?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Whether a path is excluded from authentication.
///
/// Checked against `public_paths` first (suffix glob `*.ext`, general glob,
/// trailing-slash prefix, exact match), then the compiled regex patterns.
pub fn is_public(settings: &AuthSettings, path: &str) -> bool {
    for entry in &settings.public_paths {
        if let Some(suffix) = entry.strip_prefix('*') {
            if path.ends_with(suffix) {
                return true;
            }
        } else if entry.contains('*') {
            if let Ok(pattern) = glob::Pattern::new(entry) {
                if pattern.matches(path) {
                    return true;
                }
            }
        } else if entry.ends_with('/') {
            if path.starts_with(entry.as_str()) {
                return true;
            }
        } else if path == entry {
            return true;
        }
    }

    for pattern in &settings.exclude_patterns {
        if pattern.is_match(path) {
            debug!(path, pattern = %pattern.as_str(), "Path excluded from auth by pattern");
            return true;
        }
    }

    false
}
