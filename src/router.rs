//! Request pipeline and listener
//!
//! Every accepted connection runs on its own task. A request resolves one
//! config snapshot at entry and uses it for every downstream decision; the
//! snapshot is swapped atomically on reload. Pipeline order: idle
//! accounting, rewrites, auth, static files, tenant match, try_files,
//! proxy routes, health mux, standalone server, backend dispatch. The
//! first step to produce a response wins.

use crate::auth::{self, BasicAuth};
use crate::config::{Config, RewriteFlag, Tenant};
use crate::error::{error_response, plain_response, text_body, HttpResponse, NavigatorError};
use crate::idle::IdleCoordinator;
use crate::pool::BackendPool;
use crate::proxy::{apply_forward_headers, RetryingProxy};
use crate::replay::{self, ReplayOutcome};
use crate::static_files;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The request pipeline plus its shared collaborators.
pub struct Router {
    config: RwLock<Arc<Config>>,
    auth: RwLock<Option<Arc<BasicAuth>>>,
    pool: Arc<BackendPool>,
    proxy: Arc<RetryingProxy>,
    idle: Arc<IdleCoordinator>,
}

impl Router {
    pub fn new(
        config: Arc<Config>,
        auth: Option<Arc<BasicAuth>>,
        pool: Arc<BackendPool>,
        proxy: Arc<RetryingProxy>,
        idle: Arc<IdleCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            auth: RwLock::new(auth),
            pool,
            proxy,
            idle,
        })
    }

    /// Swap the config snapshot. In-flight requests keep the one they hold.
    pub fn set_config(&self, config: Arc<Config>) {
        *self.config.write() = config;
    }

    /// Swap the auth state. Called only when a reload produced a usable one.
    pub fn set_auth(&self, auth: Option<Arc<BasicAuth>>) {
        *self.auth.write() = auth;
    }

    pub fn current_config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Accept loop. Runs until the shutdown channel flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Navigator listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let router = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let router = Arc::clone(&router);
                                    async move { router.handle(req, client_addr).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<HttpResponse, hyper::Error> {
        let _in_flight = self.idle.track();

        let config = self.current_config();
        let auth = self.auth.read().clone();

        let method = req.method().as_str().to_string();
        let mut path = req.uri().path().to_string();
        debug!(%method, %path, "Incoming request");

        // Rewrites run first so redirects stay reachable without credentials.
        for rule in &config.rewrites {
            if !rule.pattern.is_match(&path) {
                continue;
            }
            match &rule.flag {
                RewriteFlag::Redirect => {
                    let location = rule
                        .pattern
                        .replace(&path, rule.replacement.as_str())
                        .into_owned();
                    debug!(from = %path, to = %location, "Redirect rewrite");
                    return Ok(redirect_response(&location));
                }
                RewriteFlag::Last => {
                    let rewritten = rule
                        .pattern
                        .replace(&path, rule.replacement.as_str())
                        .into_owned();
                    debug!(from = %path, to = %rewritten, "Internal rewrite");
                    path = rewritten;
                }
                RewriteFlag::FlyReplay { target, status } => {
                    if !rule.applies_to_method(&method) {
                        continue;
                    }
                    apply_forward_headers(&mut req, client_addr);
                    match replay::apply(&config, target, *status, req, &self.proxy).await {
                        ReplayOutcome::Response(resp) => return Ok(resp),
                        ReplayOutcome::Continue(returned) => req = returned,
                    }
                }
            }
        }

        // Keep the request URI in sync with internal rewrites so upstreams
        // see the rewritten path.
        if path != req.uri().path() {
            let query = req
                .uri()
                .query()
                .map(|q| format!("?{}", q))
                .unwrap_or_default();
            if let Ok(uri) = format!("{}{}", path, query).parse::<Uri>() {
                *req.uri_mut() = uri;
            }
        }

        let is_public = auth::is_public(&config.auth, &path);
        let needs_auth = auth
            .as_deref()
            .map(|a| !a.realm_off())
            .unwrap_or(false)
            && !is_public;

        if needs_auth {
            if let Some(ref auth) = auth {
                let header = req
                    .headers()
                    .get(hyper::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok());
                if !auth.check(header) {
                    return Ok(auth.challenge());
                }
            }
        }

        // Static serving runs before dispatch so assets never spin up a
        // backend.
        if let Some(resp) = static_files::serve_from_static_dirs(&config, &path).await {
            return Ok(resp);
        }
        if let Some(resp) = static_files::serve_by_extension(&config, &path).await {
            return Ok(resp);
        }

        let tenant = config.find_tenant(&path).cloned();

        // try_files is confined to public paths so an authenticated backend
        // never loses a request to an HTML stub.
        if !needs_auth {
            if let Some(resp) = static_files::try_files(&config, tenant.as_ref(), &path).await {
                return Ok(resp);
            }
        }

        for route in &config.proxy_routes {
            if route.pattern.is_match(&path) && !route.excludes_method(&method) {
                for (name, value) in &route.headers {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<hyper::header::HeaderName>(),
                        HeaderValue::from_str(value),
                    ) {
                        req.headers_mut().insert(name, value);
                    }
                }
                apply_forward_headers(&mut req, client_addr);
                debug!(%path, target = %route.target, "Proxy route");
                let base = route.target.trim_end_matches('/');
                return Ok(unwrap_forward(self.proxy.forward(req, base).await));
            }
        }

        let tenant: Arc<Tenant> = match tenant.or_else(|| config.root_tenant().cloned()) {
            Some(tenant) => tenant,
            None => return Ok(health_mux(&path)),
        };

        if let Some(ref server) = tenant.standalone_server {
            apply_forward_headers(&mut req, client_addr);
            debug!(%path, server = %server, "Forwarding to standalone server");
            let base = format!("http://{}", server);
            return Ok(unwrap_forward(self.proxy.forward(req, &base).await));
        }

        let backend = match self.pool.acquire(&tenant).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(tenant = %tenant.path, error = %e, "Failed to acquire backend");
                return Ok(error_response(&e));
            }
        };

        // The full original path is preserved; the tenant mounts itself
        // under its prefix via its environment.
        apply_forward_headers(&mut req, client_addr);
        debug!(%path, tenant = %tenant.path, port = backend.port, "Proxying to backend");
        let base = format!("http://127.0.0.1:{}", backend.port);
        Ok(unwrap_forward(self.proxy.forward(req, &base).await))
    }
}

fn unwrap_forward(result: Result<HttpResponse, NavigatorError>) -> HttpResponse {
    match result {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

fn redirect_response(location: &str) -> HttpResponse {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(text_body("Found"))
        .expect("static response parts are valid")
}

/// Fallback when no tenant matches and no root tenant exists: the health
/// endpoint answers, anything else is not found.
fn health_mux(path: &str) -> HttpResponse {
    if path == "/up" {
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/html")
            .body(text_body("OK"))
            .expect("static response parts are valid")
    } else {
        plain_response(StatusCode::NOT_FOUND, "Not Found")
    }
}
