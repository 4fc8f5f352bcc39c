//! Backend pool
//!
//! One backend subprocess per active tenant, started on first request and
//! stopped when idle. The pool map is the single source of truth: at most
//! one entry (and therefore one live backend) exists per tenant path, the
//! entry is inserted before the spawn happens, and the spawn's reaper task
//! removes it when the child exits.

use crate::config::{Config, Framework, Tenant};
use crate::error::NavigatorError;
use crate::hooks::{run_hooks_logged, Hook};
use crate::managed::pipe_child_output;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Deadline for a request waiting on a starting backend.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// The idle reaper ticks at this interval, so the configured idle timeout
/// has that much slack.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Window a stopped backend gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Ports probed above `start_port`.
const PORT_RANGE_SPAN: u16 = 100;

/// Environment variable naming a backend's PID file.
const PIDFILE_VAR: &str = "PIDFILE";

/// Probe ports in ascending order and return the first that binds.
///
/// The listener is closed again immediately; the window between close and
/// the child's own bind is accepted because starts are serialized per
/// tenant and the range is larger than any realistic pool.
pub fn find_available_port(min: u16, max: u16) -> Result<u16, NavigatorError> {
    for port in min..=max {
        if let Ok(listener) = std::net::TcpListener::bind(("0.0.0.0", port)) {
            drop(listener);
            return Ok(port);
        }
    }
    Err(NavigatorError::PortExhausted { min, max })
}

/// PID file path for a tenant, when its environment defines one.
pub fn pid_file_from_env(env: &HashMap<String, String>) -> Option<PathBuf> {
    env.get(PIDFILE_VAR).map(PathBuf::from)
}

/// Kill and forget a stale backend recorded in a PID file.
///
/// A missing file is fine. A present file with a PID gets SIGTERM, a 100 ms
/// grace, then SIGKILL (failures ignored), and the file is removed.
/// Non-empty contents that do not parse are an error.
pub async fn cleanup_pid_file(path: &Path) -> Result<(), NavigatorError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(NavigatorError::PidfileIo(format!(
                "reading {}: {}",
                path.display(),
                e
            )))
        }
    };

    let trimmed = contents.trim();
    if !trimmed.is_empty() {
        let pid: i32 = trimmed.parse().map_err(|_| {
            NavigatorError::PidfileIo(format!("invalid pid '{}' in {}", trimmed, path.display()))
        })?;

        #[cfg(unix)]
        unsafe {
            if libc::kill(pid, libc::SIGTERM) == 0 {
                info!(pid, path = %path.display(), "Killed stale process from PID file");
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        #[cfg(unix)]
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NavigatorError::PidfileIo(format!(
            "removing {}: {}",
            path.display(),
            e
        ))),
    }
}

struct BackendState {
    last_access: Instant,
    starting: bool,
    failed: bool,
    pid: Option<u32>,
}

/// One running tenant subprocess.
pub struct Backend {
    pub tenant: Arc<Tenant>,
    pub port: u16,
    state: Mutex<BackendState>,
    ready_tx: broadcast::Sender<()>,
}

impl Backend {
    fn new(tenant: Arc<Tenant>, port: u16) -> Arc<Self> {
        let (ready_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            tenant,
            port,
            state: Mutex::new(BackendState {
                last_access: Instant::now(),
                starting: true,
                failed: false,
                pid: None,
            }),
            ready_tx,
        })
    }

    pub fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    pub fn is_starting(&self) -> bool {
        self.state.lock().starting
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    fn mark_ready(&self) {
        self.state.lock().starting = false;
        let _ = self.ready_tx.send(());
    }

    fn mark_failed(&self) {
        {
            let mut state = self.state.lock();
            state.failed = true;
            state.starting = false;
        }
        let _ = self.ready_tx.send(());
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.ready_tx.subscribe()
    }
}

/// Settings that can change on reload without disturbing running backends.
struct PoolRuntime {
    idle_timeout: Duration,
    min_port: u16,
    max_port: u16,
    framework: Framework,
    tenant_start_hooks: Vec<Hook>,
    tenant_stop_hooks: Vec<Hook>,
}

impl PoolRuntime {
    fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.pool.idle_timeout,
            min_port: config.pool.start_port,
            max_port: config.pool.start_port.saturating_add(PORT_RANGE_SPAN),
            framework: config.framework.clone(),
            tenant_start_hooks: config.hooks.tenant_start.clone(),
            tenant_stop_hooks: config.hooks.tenant_stop.clone(),
        }
    }
}

/// Map of tenant path to live backend, plus the reload-mutable settings.
pub struct BackendPool {
    backends: DashMap<String, Arc<Backend>>,
    runtime: RwLock<PoolRuntime>,
}

impl BackendPool {
    pub fn new(config: &Config) -> Arc<Self> {
        if config.pool.max_size > 0 {
            debug!(max_size = config.pool.max_size, "Pool max_size is advisory");
        }
        Arc::new(Self {
            backends: DashMap::new(),
            runtime: RwLock::new(PoolRuntime::from_config(config)),
        })
    }

    /// Replace reload-mutable settings. Running backends are untouched.
    pub fn update_config(&self, config: &Config) {
        *self.runtime.write() = PoolRuntime::from_config(config);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Live backend for a tenant path, if any.
    pub fn get(&self, path: &str) -> Option<Arc<Backend>> {
        self.backends.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the tenant's backend, starting one if needed.
    ///
    /// Waits up to [`ACQUIRE_TIMEOUT`] for a starting backend to become
    /// ready. At most one start is ever in flight per tenant: the map entry
    /// is claimed before the spawn task is created.
    pub async fn acquire(self: &Arc<Self>, tenant: &Arc<Tenant>) -> Result<Arc<Backend>, NavigatorError> {
        if let Some(backend) = self.get(&tenant.path) {
            backend.touch();
            return self.await_ready(backend).await;
        }

        let (min_port, max_port) = {
            let runtime = self.runtime.read();
            (runtime.min_port, runtime.max_port)
        };
        let port = find_available_port(min_port, max_port)?;

        let backend = match self.backends.entry(tenant.path.clone()) {
            Entry::Occupied(entry) => {
                // Lost the insert race; the winner's spawn is in flight.
                let existing = Arc::clone(entry.get());
                existing.touch();
                existing
            }
            Entry::Vacant(entry) => {
                let backend = Backend::new(Arc::clone(tenant), port);
                entry.insert(Arc::clone(&backend));
                let pool = Arc::clone(self);
                let starting = Arc::clone(&backend);
                tokio::spawn(async move {
                    pool.run_backend(starting).await;
                });
                backend
            }
        };

        self.await_ready(backend).await
    }

    async fn await_ready(&self, backend: Arc<Backend>) -> Result<Arc<Backend>, NavigatorError> {
        if !backend.is_starting() {
            return self.finish_ready(backend);
        }

        let mut ready_rx = backend.subscribe();
        let waited = tokio::time::timeout(ACQUIRE_TIMEOUT, async {
            loop {
                if !backend.is_starting() {
                    return;
                }
                match ready_rx.recv().await {
                    Ok(()) => return,
                    Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await;

        match waited {
            Ok(()) => self.finish_ready(backend),
            Err(_) => Err(NavigatorError::StartupTimeout(backend.tenant.path.clone())),
        }
    }

    fn finish_ready(&self, backend: Arc<Backend>) -> Result<Arc<Backend>, NavigatorError> {
        if backend.has_failed() {
            Err(NavigatorError::BackendSpawn(backend.tenant.path.clone()))
        } else {
            Ok(backend)
        }
    }

    /// The full life of one backend: spawn, ready delay, hooks, reap.
    async fn run_backend(self: Arc<Self>, backend: Arc<Backend>) {
        let (framework, start_hooks) = {
            let runtime = self.runtime.read();
            (runtime.framework.clone(), runtime.tenant_start_hooks.clone())
        };
        let tenant = Arc::clone(&backend.tenant);

        if let Some(pidfile) = pid_file_from_env(&tenant.env) {
            if let Err(e) = cleanup_pid_file(&pidfile).await {
                error!(tenant = %tenant.name, error = %e, "PID file guard failed");
                self.fail_backend(&backend);
                return;
            }
        }

        let workdir = resolve_workdir(&tenant, &framework);
        let args: Vec<String> = framework
            .args
            .iter()
            .map(|arg| arg.replace("${port}", &backend.port.to_string()))
            .collect();

        info!(
            tenant = %tenant.name,
            path = %tenant.path,
            port = backend.port,
            command = %framework.command,
            dir = %workdir.display(),
            "Starting backend"
        );

        let mut cmd = Command::new(&framework.command);
        cmd.args(&args)
            .current_dir(&workdir)
            .envs(&tenant.env)
            .env(&framework.port_env_var, backend.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(tenant = %tenant.name, error = %e, "Failed to spawn backend");
                self.fail_backend(&backend);
                return;
            }
        };

        backend.set_pid(child.id());
        pipe_child_output(&tenant.name, &mut child);

        tokio::time::sleep(framework.startup_delay).await;
        backend.mark_ready();
        info!(tenant = %tenant.name, port = backend.port, "Backend ready");

        run_hooks_logged("tenant.start", &start_hooks, &tenant.env).await;
        run_hooks_logged("tenant.start", &tenant.hooks_start, &tenant.env).await;

        // Reap: wait for exit, drop the PID file, and release the map entry
        // so the next request triggers a fresh start.
        let status = child.wait().await;
        backend.set_pid(None);
        match status {
            Ok(status) => info!(tenant = %tenant.name, port = backend.port, %status, "Backend exited"),
            Err(e) => warn!(tenant = %tenant.name, error = %e, "Error waiting for backend"),
        }

        if let Some(pidfile) = pid_file_from_env(&tenant.env) {
            remove_file_quiet(&pidfile).await;
        }
        self.remove_if_same(&tenant.path, &backend);
    }

    fn fail_backend(&self, backend: &Arc<Backend>) {
        backend.mark_failed();
        self.remove_if_same(&backend.tenant.path, backend);
    }

    /// Remove the map entry only if it still refers to this backend; a
    /// replacement started in the meantime must not be evicted.
    fn remove_if_same(&self, path: &str, backend: &Arc<Backend>) {
        self.backends
            .remove_if(path, |_, existing| Arc::ptr_eq(existing, backend));
    }

    /// Stop every backend whose last access is older than the idle timeout.
    pub async fn release_idle(&self) {
        let idle_timeout = self.runtime.read().idle_timeout;

        let mut to_stop = Vec::new();
        for entry in self.backends.iter() {
            let backend = entry.value();
            if !backend.is_starting() && backend.last_access().elapsed() > idle_timeout {
                to_stop.push(entry.key().clone());
            }
        }

        for path in to_stop {
            info!(path = %path, "Stopping idle backend");
            self.stop(&path).await;
        }
    }

    /// Stop one backend: remove the map entry, drop its PID file, terminate
    /// the child, and run tenant stop hooks. No-op when absent.
    pub async fn stop(&self, path: &str) {
        let Some((_, backend)) = self.backends.remove(path) else {
            return;
        };

        info!(path = %path, port = backend.port, "Stopping backend");

        if let Some(pidfile) = pid_file_from_env(&backend.tenant.env) {
            remove_file_quiet(&pidfile).await;
        }
        terminate_child(&backend).await;

        let stop_hooks = self.runtime.read().tenant_stop_hooks.clone();
        run_hooks_logged("tenant.stop", &stop_hooks, &backend.tenant.env).await;
        run_hooks_logged("tenant.stop", &backend.tenant.hooks_stop, &backend.tenant.env).await;
    }

    /// Stop everything, terminating the children concurrently.
    pub async fn shutdown(&self) {
        let backends: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.backends.clear();

        if backends.is_empty() {
            return;
        }
        info!(count = backends.len(), "Stopping all backends");

        let mut terminations = Vec::new();
        for backend in backends {
            if let Some(pidfile) = pid_file_from_env(&backend.tenant.env) {
                remove_file_quiet(&pidfile).await;
            }
            terminations.push(tokio::spawn(async move {
                terminate_child(&backend).await;
            }));
        }
        for termination in terminations {
            let _ = termination.await;
        }
    }

    /// One task sweeping for idle backends every minute.
    pub fn spawn_idle_reaper(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.release_idle().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Terminate a backend's child: SIGTERM, the grace window, then SIGKILL if
/// the reaper has not observed an exit. A tenant that ignores SIGTERM must
/// not outlive its pool entry.
async fn terminate_child(backend: &Arc<Backend>) {
    let Some(pid) = backend.pid() else {
        return;
    };

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    tokio::time::sleep(STOP_GRACE).await;

    // The reaper clears the PID once `wait()` returns; a surviving PID
    // means the child shrugged off SIGTERM.
    if let Some(pid) = backend.pid() {
        warn!(path = %backend.tenant.path, pid, "Backend survived SIGTERM, sending SIGKILL");
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

/// Working directory for a backend: tenant root with a trailing `/public`
/// stripped, else the framework app directory, else the current directory
/// when neither exists on disk.
fn resolve_workdir(tenant: &Tenant, framework: &Framework) -> PathBuf {
    if let Some(ref root) = tenant.root {
        let text = root.to_string_lossy();
        let stripped = PathBuf::from(text.trim_end_matches("/public"));
        if stripped.is_dir() {
            return stripped;
        }
    }
    if let Some(ref dir) = framework.app_directory {
        if dir.is_dir() {
            return dir.clone();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

async fn remove_file_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config(start_port: u16) -> Config {
        let yaml = format!(
            "applications:\n  framework:\n    command: sleep\n    args: [\"60\"]\n    startup_delay: 0\n  pools:\n    start_port: {}\n    timeout: 300\n",
            start_port
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn test_tenant(path: &str) -> Arc<Tenant> {
        Arc::new(Tenant {
            name: path.trim_matches('/').to_string(),
            path: path.to_string(),
            root: None,
            special: false,
            match_pattern: None,
            standalone_server: None,
            env: HashMap::new(),
            var: HashMap::new(),
            hooks_start: Vec::new(),
            hooks_stop: Vec::new(),
        })
    }

    #[test]
    fn test_find_port_skips_occupied() {
        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let port = find_available_port(held, held + 10).unwrap();
        assert_ne!(port, held);
        assert!(port > held && port <= held + 10);
    }

    #[test]
    fn test_find_port_exhausted() {
        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let result = find_available_port(held, held);
        assert!(matches!(result, Err(NavigatorError::PortExhausted { .. })));
    }

    #[test]
    fn test_pid_file_from_env() {
        let mut env = HashMap::new();
        assert!(pid_file_from_env(&env).is_none());
        env.insert("PIDFILE".to_string(), "/tmp/app.pid".to_string());
        assert_eq!(pid_file_from_env(&env), Some(PathBuf::from("/tmp/app.pid")));
    }

    #[tokio::test]
    async fn test_cleanup_missing_pid_file() {
        assert!(cleanup_pid_file(Path::new("/tmp/navigator-test-no-such.pid"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_removes_valid_pid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // A PID that certainly refers to no live process.
        writeln!(file, "99999999").unwrap();
        let path = file.path().to_path_buf();

        cleanup_pid_file(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_garbage_pid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not-a-pid").unwrap();

        let result = cleanup_pid_file(file.path()).await;
        assert!(matches!(result, Err(NavigatorError::PidfileIo(_))));
    }

    #[tokio::test]
    async fn test_cleanup_empty_pid_file_is_removed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        cleanup_pid_file(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_acquire_starts_and_reuses_backend() {
        let config = test_config(42100);
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/shop/");

        let first = pool.acquire(&tenant).await.unwrap();
        assert!(!first.is_starting());
        assert!(first.port >= 42100 && first.port <= 42200);

        let second = pool.acquire(&tenant).await.unwrap();
        assert_eq!(first.port, second.port);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_backend() {
        let config = test_config(42300);
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/shop/");

        let (a, b) = tokio::join!(pool.acquire(&tenant), pool.acquire(&tenant));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let yaml = "applications:\n  framework:\n    command: /nonexistent/navigator-test-binary\n    args: []\n    startup_delay: 0\n  pools:\n    start_port: 42500\n";
        let config = Config::from_yaml(yaml).unwrap();
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/broken/");

        let result = pool.acquire(&tenant).await;
        assert!(matches!(result, Err(NavigatorError::BackendSpawn(_))));
        // The failed entry must not linger; the next acquire retries.
        assert!(pool.get("/broken/").is_none());
    }

    #[tokio::test]
    async fn test_stop_removes_backend() {
        let config = test_config(42700);
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/shop/");

        pool.acquire(&tenant).await.unwrap();
        assert!(pool.get("/shop/").is_some());

        pool.stop("/shop/").await;
        assert!(pool.get("/shop/").is_none());

        // Stopping again is a no-op.
        pool.stop("/shop/").await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        // The child ignores SIGTERM; stop() must still take it down.
        let yaml = "applications:\n  framework:\n    command: sh\n    args: [\"-c\", \"trap '' TERM; exec sleep 60\"]\n    startup_delay: 0\n  pools:\n    start_port: 43300\n";
        let config = Config::from_yaml(yaml).unwrap();
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/stubborn/");

        let backend = pool.acquire(&tenant).await.unwrap();
        assert!(backend.pid().is_some());

        pool.stop("/stubborn/").await;
        assert!(pool.get("/stubborn/").is_none());

        // The reaper observes the SIGKILL exit and clears the PID.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(backend.pid().is_none());
    }

    #[tokio::test]
    async fn test_release_idle_respects_timeout() {
        let config = test_config(42900);
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/shop/");

        pool.acquire(&tenant).await.unwrap();

        // Fresh backend survives the sweep.
        pool.release_idle().await;
        assert_eq!(pool.len(), 1);

        // Shrink the timeout to zero and sweep again.
        let yaml = "applications:\n  framework:\n    command: sleep\n    args: [\"60\"]\n    startup_delay: 0\n  pools:\n    start_port: 42900\n    timeout: 0\n";
        pool.update_config(&Config::from_yaml(yaml).unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release_idle().await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_update_config_keeps_backends() {
        let config = test_config(43100);
        let pool = BackendPool::new(&config);
        let tenant = test_tenant("/shop/");

        let backend = pool.acquire(&tenant).await.unwrap();
        pool.update_config(&test_config(43150));

        let again = pool.acquire(&tenant).await.unwrap();
        assert!(Arc::ptr_eq(&backend, &again));

        pool.shutdown().await;
    }

    #[test]
    fn test_resolve_workdir_strips_public() {
        let temp = tempfile::TempDir::new().unwrap();
        let app = temp.path().join("app");
        std::fs::create_dir_all(&app).unwrap();

        let mut tenant = test_tenant("/app/");
        Arc::get_mut(&mut tenant).unwrap().root = Some(app.join("public"));

        let framework = Framework::default();
        assert_eq!(resolve_workdir(&tenant, &framework), app);
    }

    #[test]
    fn test_resolve_workdir_falls_back_to_cwd() {
        let tenant = test_tenant("/app/");
        let framework = Framework {
            app_directory: Some(PathBuf::from("/nonexistent/navigator-test")),
            ..Framework::default()
        };
        assert_eq!(
            resolve_workdir(&tenant, &framework),
            std::env::current_dir().unwrap()
        );
    }
}
