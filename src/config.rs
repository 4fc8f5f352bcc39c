//! Configuration model
//!
//! The YAML file is deserialized into raw serde structs and then compiled
//! into the immutable runtime [`Config`]: regexes compiled, durations
//! parsed, defaults applied, and tenant environments resolved (template
//! substitution from each tenant's `var` map). A `Config` is built once at
//! startup and again on SIGHUP; requests only ever see one snapshot.

use crate::hooks::{Hook, LifecycleHooks};
use crate::managed::ManagedProcessConfig;
use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default listen port.
const DEFAULT_LISTEN: u16 = 3000;
/// Default first port handed to tenant backends.
const DEFAULT_START_PORT: u16 = 4000;
/// Default backend idle timeout.
const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(600);
/// Default delay between spawn and marking a backend ready.
const DEFAULT_STARTUP_DELAY: u64 = 5;

/// Extensions served statically when the config does not list its own.
const DEFAULT_STATIC_EXTENSIONS: &[&str] = &[
    "html", "htm", "txt", "xml", "json", "css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico",
    "pdf", "xlsx", "woff", "woff2", "ttf", "eot",
];

/// Suffixes probed by try_files when enabled without an explicit list.
const DEFAULT_TRY_FILES_SUFFIXES: &[&str] = &[".html", ".htm", ".txt", ".xml", ".json"];

/// What to do with the machine when the server goes idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Suspend,
    Stop,
}

impl IdleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdleAction::Suspend => "suspend",
            IdleAction::Stop => "stop",
        }
    }
}

/// Target of a fly-replay rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayTarget {
    Region(String),
    App(String),
    Machine { id: String, app: String },
}

/// Action taken when a rewrite rule matches.
#[derive(Debug, Clone)]
pub enum RewriteFlag {
    /// 302 to the rewritten target.
    Redirect,
    /// Mutate the request path and keep going.
    Last,
    /// Hand off to the replay decider.
    FlyReplay { target: ReplayTarget, status: u16 },
}

/// A compiled rewrite rule, evaluated in declaration order.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub pattern: Regex,
    pub replacement: String,
    pub flag: RewriteFlag,
    /// Empty means all methods.
    pub methods: Vec<String>,
}

impl RewriteRule {
    pub fn applies_to_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// A route proxied to a fixed upstream instead of a tenant backend.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    pub pattern: Regex,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub exclude_methods: Vec<String>,
}

impl ProxyRoute {
    pub fn excludes_method(&self, method: &str) -> bool {
        self.exclude_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// A static directory mapping.
#[derive(Debug, Clone)]
pub struct StaticDir {
    /// URL prefix, e.g. `/assets/`.
    pub url_path: String,
    /// Filesystem path relative to `public_dir`.
    pub local_path: String,
    /// Cache TTL in seconds; 0 disables the Cache-Control header.
    pub cache_ttl: u32,
}

/// Shared launch template for tenant backends.
#[derive(Debug, Clone)]
pub struct Framework {
    pub command: String,
    /// Arguments; the literal token `${port}` is replaced at spawn.
    pub args: Vec<String>,
    pub app_directory: Option<PathBuf>,
    pub port_env_var: String,
    pub startup_delay: Duration,
}

impl Default for Framework {
    fn default() -> Self {
        Self {
            command: "bin/rails".to_string(),
            args: vec!["server".to_string(), "-p".to_string(), "${port}".to_string()],
            app_directory: None,
            port_env_var: "PORT".to_string(),
            startup_delay: Duration::from_secs(DEFAULT_STARTUP_DELAY),
        }
    }
}

/// One configured tenant.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub name: String,
    /// URL prefix, e.g. `/shop/`.
    pub path: String,
    pub root: Option<PathBuf>,
    /// Suppresses env-template substitution.
    pub special: bool,
    /// Glob matched against the whole path; takes priority over prefix match.
    pub match_pattern: Option<glob::Pattern>,
    /// `host:port` to proxy to directly, bypassing the pool.
    pub standalone_server: Option<String>,
    /// Resolved environment: substituted shared template plus overrides.
    pub env: HashMap<String, String>,
    pub var: HashMap<String, String>,
    pub hooks_start: Vec<Hook>,
    pub hooks_stop: Vec<Hook>,
}

/// Authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub realm: String,
    pub htpasswd: Option<PathBuf>,
    pub public_paths: Vec<String>,
    pub exclude_patterns: Vec<Regex>,
}

/// Backend pool sizing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Parsed but advisory; the port range already bounds the pool.
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub start_port: u16,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 0,
            idle_timeout: DEFAULT_POOL_TIMEOUT,
            start_port: DEFAULT_START_PORT,
        }
    }
}

/// Immutable runtime configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: u16,
    pub hostname: Option<String>,
    pub public_dir: PathBuf,
    pub idle_action: Option<IdleAction>,
    pub idle_timeout: Duration,
    pub auth: AuthSettings,
    pub rewrites: Vec<RewriteRule>,
    pub proxy_routes: Vec<ProxyRoute>,
    pub static_dirs: Vec<StaticDir>,
    pub static_extensions: Vec<String>,
    pub try_files_suffixes: Vec<String>,
    pub framework: Framework,
    pub tenants: Vec<Arc<Tenant>>,
    pub pool: PoolSettings,
    pub managed_processes: Vec<ManagedProcessConfig>,
    pub hooks: LifecycleHooks,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl Config {
    /// Load and compile a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_yaml(&content)
    }

    /// Compile a configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content).context("parsing YAML")?;
        compile(raw)
    }

    /// Path of the maintenance page used for replay loops.
    pub fn maintenance_page(&self) -> PathBuf {
        self.public_dir.join("503.html")
    }

    /// Tenant lookup: glob match patterns first (declaration order), then
    /// the longest path prefix.
    pub fn find_tenant(&self, path: &str) -> Option<&Arc<Tenant>> {
        for tenant in &self.tenants {
            if let Some(ref pattern) = tenant.match_pattern {
                if pattern.matches(path) {
                    return Some(tenant);
                }
            }
        }

        let mut best: Option<&Arc<Tenant>> = None;
        let mut best_len = 0;
        for tenant in &self.tenants {
            if path.starts_with(&tenant.path) && tenant.path.len() > best_len {
                best = Some(tenant);
                best_len = tenant.path.len();
            }
        }
        best
    }

    /// The root tenant (`/`), if configured.
    pub fn root_tenant(&self) -> Option<&Arc<Tenant>> {
        self.tenants.iter().find(|t| t.path == "/")
    }
}

fn compile(raw: RawConfig) -> anyhow::Result<Config> {
    let listen = raw.server.listen.unwrap_or(DEFAULT_LISTEN);
    let public_dir = PathBuf::from(raw.server.public_dir.unwrap_or_else(|| "public".to_string()));

    let (idle_action, idle_timeout) = match raw.server.idle {
        Some(idle) => {
            let action = match idle.action.as_deref() {
                Some("suspend") => Some(IdleAction::Suspend),
                Some("stop") => Some(IdleAction::Stop),
                Some(other) => anyhow::bail!("unknown idle action '{}'", other),
                None => None,
            };
            let timeout = match idle.timeout {
                Some(d) => parse_duration(&d)?,
                None => Duration::from_secs(20 * 60),
            };
            (action, timeout)
        }
        None => (None, Duration::from_secs(20 * 60)),
    };

    let auth = compile_auth(raw.auth)?;
    let rewrites = compile_rewrites(raw.routes.redirects, raw.routes.rewrites, raw.routes.fly_replay)?;
    let proxy_routes = compile_proxy_routes(raw.routes.proxies, raw.routes.reverse_proxies)?;

    let static_dirs = raw
        .statics
        .directories
        .into_iter()
        .map(|d| StaticDir {
            url_path: d.path,
            local_path: d.root,
            cache_ttl: d.cache,
        })
        .collect();

    let static_extensions = if raw.statics.extensions.is_empty() {
        DEFAULT_STATIC_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    } else {
        raw.statics.extensions
    };

    let try_files_suffixes = if raw.statics.try_files.enabled {
        if raw.statics.try_files.suffixes.is_empty() {
            DEFAULT_TRY_FILES_SUFFIXES.iter().map(|s| s.to_string()).collect()
        } else {
            raw.statics.try_files.suffixes
        }
    } else {
        Vec::new()
    };

    let framework = match raw.applications.framework {
        Some(f) => Framework {
            command: f.command,
            args: if f.args.is_empty() {
                Framework::default().args
            } else {
                f.args
            },
            app_directory: f.app_directory.map(PathBuf::from),
            port_env_var: f.port_env_var.unwrap_or_else(|| "PORT".to_string()),
            startup_delay: Duration::from_secs(f.startup_delay.unwrap_or(DEFAULT_STARTUP_DELAY)),
        },
        None => Framework::default(),
    };

    let pool = match raw.applications.pools {
        Some(p) => PoolSettings {
            max_size: p.max_size.unwrap_or(0),
            idle_timeout: match p.timeout {
                Some(d) => parse_duration(&d)?,
                None => DEFAULT_POOL_TIMEOUT,
            },
            start_port: p.start_port.unwrap_or(DEFAULT_START_PORT),
        },
        None => PoolSettings::default(),
    };

    let tenants = raw
        .applications
        .tenants
        .into_iter()
        .map(|t| compile_tenant(t, &raw.applications.env))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut managed_processes = raw.managed_processes;
    if let Some(vector) = raw.logging.vector {
        if vector.enabled {
            managed_processes.insert(
                0,
                ManagedProcessConfig {
                    name: "vector".to_string(),
                    command: vector.command.unwrap_or_else(|| "vector".to_string()),
                    args: vector.args,
                    working_dir: None,
                    env: HashMap::new(),
                    auto_restart: true,
                    start_delay: 0,
                },
            );
        }
    }

    let hooks = LifecycleHooks {
        server_start: raw.hooks.server.start,
        server_ready: raw.hooks.server.ready,
        server_idle: raw.hooks.server.idle,
        tenant_start: raw.hooks.tenant.start,
        tenant_stop: raw.hooks.tenant.stop,
    };

    Ok(Config {
        listen,
        hostname: raw.server.hostname,
        public_dir,
        idle_action,
        idle_timeout,
        auth,
        rewrites,
        proxy_routes,
        static_dirs,
        static_extensions,
        try_files_suffixes,
        framework,
        tenants,
        pool,
        managed_processes,
        hooks,
        log_level: raw.logging.level,
        log_format: raw.logging.format,
    })
}

fn compile_auth(raw: RawAuth) -> anyhow::Result<AuthSettings> {
    let mut exclude_patterns = Vec::new();
    for entry in raw.exclude_patterns {
        let re = Regex::new(&entry.pattern)
            .with_context(|| format!("invalid auth pattern '{}'", entry.pattern))?;
        exclude_patterns.push(re);
    }

    Ok(AuthSettings {
        enabled: raw.enabled,
        realm: raw.realm.unwrap_or_else(|| "Restricted".to_string()),
        htpasswd: raw.htpasswd.map(PathBuf::from),
        public_paths: raw.public_paths,
        exclude_patterns,
    })
}

fn compile_rewrites(
    redirects: Vec<RawFromTo>,
    rewrites: Vec<RawFromTo>,
    fly_replay: Vec<RawFlyReplay>,
) -> anyhow::Result<Vec<RewriteRule>> {
    let mut rules = Vec::new();

    for r in redirects {
        rules.push(RewriteRule {
            pattern: Regex::new(&r.from).with_context(|| format!("invalid redirect '{}'", r.from))?,
            replacement: r.to,
            flag: RewriteFlag::Redirect,
            methods: Vec::new(),
        });
    }

    for r in rewrites {
        rules.push(RewriteRule {
            pattern: Regex::new(&r.from).with_context(|| format!("invalid rewrite '{}'", r.from))?,
            replacement: r.to,
            flag: RewriteFlag::Last,
            methods: Vec::new(),
        });
    }

    for r in fly_replay {
        let target = match (r.region, r.app, r.machine) {
            (Some(region), None, None) => ReplayTarget::Region(region),
            (None, Some(app), None) => ReplayTarget::App(app),
            (None, None, Some(machine)) => {
                let (id, app) = machine.split_once(':').ok_or_else(|| {
                    anyhow::anyhow!("machine target '{}' must be 'ID:APP'", machine)
                })?;
                ReplayTarget::Machine {
                    id: id.to_string(),
                    app: app.to_string(),
                }
            }
            _ => anyhow::bail!(
                "fly_replay rule '{}' needs exactly one of region, app, machine",
                r.path
            ),
        };

        rules.push(RewriteRule {
            pattern: Regex::new(&r.path).with_context(|| format!("invalid fly_replay '{}'", r.path))?,
            replacement: String::new(),
            flag: RewriteFlag::FlyReplay {
                target,
                status: r.status.unwrap_or(307),
            },
            methods: r.methods,
        });
    }

    Ok(rules)
}

fn compile_proxy_routes(
    proxies: Vec<RawProxy>,
    reverse_proxies: Vec<RawReverseProxy>,
) -> anyhow::Result<Vec<ProxyRoute>> {
    let mut routes = Vec::new();

    for p in proxies {
        routes.push(ProxyRoute {
            pattern: Regex::new(&p.path).with_context(|| format!("invalid proxy '{}'", p.path))?,
            target: p.target,
            headers: p.headers,
            exclude_methods: Vec::new(),
        });
    }

    for p in reverse_proxies {
        routes.push(ProxyRoute {
            pattern: Regex::new(&p.path)
                .with_context(|| format!("invalid reverse proxy '{}'", p.path))?,
            target: p.target,
            headers: p.headers,
            exclude_methods: p.exclude_methods,
        });
    }

    Ok(routes)
}

fn compile_tenant(raw: RawTenant, env_template: &HashMap<String, String>) -> anyhow::Result<Arc<Tenant>> {
    let match_pattern = match raw.match_pattern {
        Some(ref p) => Some(
            glob::Pattern::new(p).with_context(|| format!("invalid match pattern '{}'", p))?,
        ),
        None => None,
    };

    // Shared template entries first; tenant entries override. Special tenants
    // receive the template verbatim, without substitution.
    let mut env = HashMap::new();
    for (key, template) in env_template {
        let value = if raw.special {
            template.clone()
        } else {
            substitute_vars(template, &raw.var)
        };
        env.insert(key.clone(), value);
    }
    env.extend(raw.env);

    let (hooks_start, hooks_stop) = match raw.hooks {
        Some(h) => (h.start, h.stop),
        None => (Vec::new(), Vec::new()),
    };

    Ok(Arc::new(Tenant {
        name: raw.name,
        path: raw.path,
        root: raw.root.map(PathBuf::from),
        special: raw.special,
        match_pattern,
        standalone_server: raw.standalone_server,
        env,
        var: raw.var,
        hooks_start,
        hooks_stop,
    }))
}

/// Replace `${name}` tokens from the variable map. Single pass: tokens
/// introduced by a replacement value are left as-is.
pub fn substitute_vars(template: &str, vars: &HashMap<String, String>) -> String {
    // Compiling per call is fine; this only runs at config load.
    let token = Regex::new(r"\$\{([A-Za-z0-9_.]+)\}").expect("token pattern is valid");
    token
        .replace_all(template, |caps: &regex::Captures| {
            match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Parse a duration given as integer seconds or as `NNs`/`NNm`/`NNh`.
fn parse_duration(raw: &RawDuration) -> anyhow::Result<Duration> {
    match raw {
        RawDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
        RawDuration::Text(text) => {
            let text = text.trim();
            let (value, unit) = match text.chars().last() {
                Some('s') => (&text[..text.len() - 1], 1u64),
                Some('m') => (&text[..text.len() - 1], 60),
                Some('h') => (&text[..text.len() - 1], 3600),
                _ => (text, 1),
            };
            let n: u64 = value
                .parse()
                .with_context(|| format!("invalid duration '{}'", text))?;
            Ok(Duration::from_secs(n * unit))
        }
    }
}

// Raw deserialization structures. Field names match the YAML sections.

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    auth: RawAuth,
    #[serde(default)]
    routes: RawRoutes,
    #[serde(default, rename = "static")]
    statics: RawStatic,
    #[serde(default)]
    applications: RawApplications,
    #[serde(default)]
    managed_processes: Vec<ManagedProcessConfig>,
    #[serde(default)]
    logging: RawLogging,
    #[serde(default)]
    hooks: RawHooks,
}

#[derive(Debug, Deserialize, Default)]
struct RawServer {
    listen: Option<u16>,
    hostname: Option<String>,
    public_dir: Option<String>,
    idle: Option<RawIdle>,
}

#[derive(Debug, Deserialize)]
struct RawIdle {
    action: Option<String>,
    timeout: Option<RawDuration>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Deserialize, Default)]
struct RawAuth {
    #[serde(default)]
    enabled: bool,
    realm: Option<String>,
    htpasswd: Option<String>,
    #[serde(default)]
    public_paths: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<RawAuthPattern>,
}

#[derive(Debug, Deserialize)]
struct RawAuthPattern {
    pattern: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRoutes {
    #[serde(default)]
    redirects: Vec<RawFromTo>,
    #[serde(default)]
    rewrites: Vec<RawFromTo>,
    #[serde(default)]
    fly_replay: Vec<RawFlyReplay>,
    #[serde(default)]
    proxies: Vec<RawProxy>,
    #[serde(default)]
    reverse_proxies: Vec<RawReverseProxy>,
}

#[derive(Debug, Deserialize)]
struct RawFromTo {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct RawFlyReplay {
    path: String,
    region: Option<String>,
    app: Option<String>,
    machine: Option<String>,
    status: Option<u16>,
    #[serde(default)]
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    path: String,
    target: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawReverseProxy {
    path: String,
    target: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    exclude_methods: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawStatic {
    #[serde(default)]
    directories: Vec<RawStaticDir>,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    try_files: RawTryFiles,
}

#[derive(Debug, Deserialize)]
struct RawStaticDir {
    path: String,
    root: String,
    #[serde(default)]
    cache: u32,
}

#[derive(Debug, Deserialize, Default)]
struct RawTryFiles {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    suffixes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawApplications {
    framework: Option<RawFramework>,
    #[serde(default)]
    env: HashMap<String, String>,
    pools: Option<RawPools>,
    #[serde(default)]
    tenants: Vec<RawTenant>,
}

#[derive(Debug, Deserialize)]
struct RawFramework {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    app_directory: Option<String>,
    port_env_var: Option<String>,
    startup_delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPools {
    max_size: Option<usize>,
    timeout: Option<RawDuration>,
    start_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTenant {
    name: String,
    path: String,
    root: Option<String>,
    #[serde(default)]
    special: bool,
    match_pattern: Option<String>,
    standalone_server: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    var: HashMap<String, String>,
    hooks: Option<RawTenantHooks>,
}

#[derive(Debug, Deserialize)]
struct RawTenantHooks {
    #[serde(default)]
    start: Vec<Hook>,
    #[serde(default)]
    stop: Vec<Hook>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLogging {
    level: Option<String>,
    format: Option<String>,
    vector: Option<RawVector>,
}

#[derive(Debug, Deserialize)]
struct RawVector {
    #[serde(default)]
    enabled: bool,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawHooks {
    #[serde(default)]
    server: RawServerHooks,
    #[serde(default)]
    tenant: RawTenantHookDefaults,
}

#[derive(Debug, Deserialize, Default)]
struct RawServerHooks {
    #[serde(default)]
    start: Vec<Hook>,
    #[serde(default)]
    ready: Vec<Hook>,
    #[serde(default)]
    idle: Vec<Hook>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTenantHookDefaults {
    #[serde(default)]
    start: Vec<Hook>,
    #[serde(default)]
    stop: Vec<Hook>,
}
