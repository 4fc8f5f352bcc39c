//! Static file serving
//!
//! Three probes, in pipeline order: configured static directories (under
//! `public_dir`), extension-based serving from the matched tenant's root,
//! and try_files suffix probing for extensionless public paths. All paths
//! are joined below a configured root; traversal segments are rejected.

use crate::config::{Config, Tenant};
use crate::error::{text_body, HttpResponse};
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Fallback body when no maintenance page is configured on disk.
const BUILTIN_MAINTENANCE_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Temporarily Unavailable</title></head>\n<body>\n<h1>Temporarily Unavailable</h1>\n<p>The request could not be completed. Please retry shortly.</p>\n</body>\n</html>\n";

/// Content type by file extension. Unknown extensions get no header,
/// matching the upstream server behavior.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    let content_type = match ext {
        "js" => "application/javascript",
        "css" => "text/css",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => return None,
    };
    Some(content_type)
}

/// Whether the path ends in one of the configured static extensions.
pub fn has_static_extension(extensions: &[String], path: &str) -> bool {
    let ext = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext,
        None => return false,
    };
    extensions.iter().any(|e| e == ext)
}

/// Whether the path carries any extension at all.
pub fn has_extension(path: &str) -> bool {
    Path::new(path).extension().is_some()
}

/// Join a URL remainder under a filesystem base, refusing traversal.
fn join_under(base: &Path, remainder: &str) -> Option<PathBuf> {
    if remainder.contains("..") || remainder.contains('\0') {
        return None;
    }
    Some(base.join(remainder.trim_start_matches('/')))
}

/// Serve a regular file if it exists. `cache_ttl` of 0 omits Cache-Control.
pub async fn serve_file(fs_path: &Path, cache_ttl: u32) -> Option<HttpResponse> {
    let metadata = tokio::fs::metadata(fs_path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let contents = tokio::fs::read(fs_path).await.ok()?;

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = content_type_for(fs_path) {
        builder = builder.header(hyper::header::CONTENT_TYPE, content_type);
    }
    if cache_ttl > 0 {
        builder = builder.header(
            hyper::header::CACHE_CONTROL,
            format!("public, max-age={}", cache_ttl),
        );
    }

    Some(
        builder
            .body(text_body(contents))
            .expect("static response parts are valid"),
    )
}

/// Probe the configured static directories for the request path.
pub async fn serve_from_static_dirs(config: &Config, path: &str) -> Option<HttpResponse> {
    for dir in &config.static_dirs {
        if let Some(remainder) = path.strip_prefix(&dir.url_path) {
            let base = join_under(&config.public_dir, &dir.local_path)?;
            let fs_path = join_under(&base, remainder)?;
            if let Some(resp) = serve_file(&fs_path, dir.cache_ttl).await {
                debug!(path, file = %fs_path.display(), "Serving from static directory");
                return Some(resp);
            }
        }
    }
    None
}

/// Root of a tenant for static purposes: its own root, else the public dir.
fn tenant_static_root<'a>(config: &'a Config, tenant: &'a Tenant) -> &'a Path {
    tenant.root.as_deref().unwrap_or(&config.public_dir)
}

/// Longest-prefix tenant match, ignoring glob patterns. Static serving only
/// cares where the files live, not how requests are routed.
fn longest_prefix_tenant<'a>(config: &'a Config, path: &str) -> Option<&'a Arc<Tenant>> {
    let mut best: Option<&Arc<Tenant>> = None;
    let mut best_len = 0;
    for tenant in &config.tenants {
        if path.starts_with(&tenant.path) && tenant.path.len() > best_len {
            best = Some(tenant);
            best_len = tenant.path.len();
        }
    }
    best
}

/// Serve a path with a known static extension from the matched tenant root.
///
/// Tries `<root><rel>` first, then `<root minus /public>/public<rel>`.
pub async fn serve_by_extension(config: &Config, path: &str) -> Option<HttpResponse> {
    if !has_static_extension(&config.static_extensions, path) {
        return None;
    }

    let tenant = longest_prefix_tenant(config, path)?;
    let root = tenant_static_root(config, tenant);
    let remainder = path.strip_prefix(&tenant.path).unwrap_or(path);

    let direct = join_under(root, remainder)?;
    if let Some(resp) = serve_file(&direct, 0).await {
        debug!(path, file = %direct.display(), "Serving static file");
        return Some(resp);
    }

    let stripped = root.to_string_lossy();
    let stripped = stripped.trim_end_matches("/public");
    let public = join_under(&Path::new(stripped).join("public"), remainder)?;
    if let Some(resp) = serve_file(&public, 0).await {
        debug!(path, file = %public.display(), "Serving static file from public dir");
        return Some(resp);
    }

    None
}

/// try_files: probe suffixed variants of an extensionless path.
///
/// The matched static directory is consulted first, then the tenant root
/// (with its `/public` variant).
pub async fn try_files(config: &Config, tenant: Option<&Arc<Tenant>>, path: &str) -> Option<HttpResponse> {
    if config.try_files_suffixes.is_empty() || has_extension(path) {
        return None;
    }

    for suffix in &config.try_files_suffixes {
        for dir in &config.static_dirs {
            if let Some(remainder) = path.strip_prefix(&dir.url_path) {
                let base = join_under(&config.public_dir, &dir.local_path)?;
                let candidate = join_under(&base, &format!("{}{}", remainder, suffix))?;
                if let Some(resp) = serve_file(&candidate, dir.cache_ttl).await {
                    debug!(path, file = %candidate.display(), "try_files hit in static directory");
                    return Some(resp);
                }
            }
        }

        if let Some(tenant) = tenant {
            let root = tenant_static_root(config, tenant);
            let remainder = path.strip_prefix(&tenant.path).unwrap_or(path);
            let suffixed = format!("{}{}", remainder, suffix);

            let direct = join_under(root, &suffixed)?;
            if let Some(resp) = serve_file(&direct, 0).await {
                debug!(path, file = %direct.display(), "try_files hit in tenant root");
                return Some(resp);
            }

            let stripped = root.to_string_lossy();
            let stripped = stripped.trim_end_matches("/public");
            let public = join_under(&Path::new(stripped).join("public"), &suffixed)?;
            if let Some(resp) = serve_file(&public, 0).await {
                debug!(path, file = %public.display(), "try_files hit in tenant public dir");
                return Some(resp);
            }
        }
    }

    None
}

/// The 503 maintenance page: file-sourced when present, built-in otherwise.
pub async fn maintenance_page(config: &Config) -> HttpResponse {
    let body = match tokio::fs::read_to_string(config.maintenance_page()).await {
        Ok(contents) => contents,
        Err(_) => BUILTIN_MAINTENANCE_PAGE.to_string(),
    };

    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(text_body(body))
        .expect("static response parts are valid")
}
