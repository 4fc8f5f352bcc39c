use navigator::auth::BasicAuth;
use navigator::config::Config;
use navigator::hooks;
use navigator::idle::IdleCoordinator;
use navigator::managed::ProcessSupervisor;
use navigator::pool::BackendPool;
use navigator::proxy::RetryingProxy;
use navigator::router::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config path used when none is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "config/navigator.yml";

/// Where this process records its own PID, so `-s reload` can find it.
const NAVIGATOR_PID_FILE: &str = "/tmp/navigator.pid";

const USAGE: &str = "Usage: navigator [config-path]
       navigator -s reload
       navigator --help

Starts the navigator server using the given YAML configuration file
(default: config/navigator.yml). `-s reload` sends SIGHUP to a running
instance. Signals: HUP reloads the configuration, TERM and INT shut down.";

enum Cli {
    Serve(PathBuf),
    Reload,
    Help,
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    match args.first().map(String::as_str) {
        None => Ok(Cli::Serve(PathBuf::from(DEFAULT_CONFIG_PATH))),
        Some("--help") | Some("-h") => Ok(Cli::Help),
        Some("-s") => match args.get(1).map(String::as_str) {
            Some("reload") => Ok(Cli::Reload),
            Some(other) => Err(format!("unknown signal '{}'", other)),
            None => Err("-s requires a signal name".to_string()),
        },
        Some(path) if path.starts_with('-') => Err(format!("unknown option '{}'", path)),
        Some(path) => Ok(Cli::Serve(PathBuf::from(path))),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match parse_args(&args) {
        Ok(Cli::Help) => println!("{}", USAGE),
        Ok(Cli::Reload) => std::process::exit(reload_command()),
        Ok(Cli::Serve(config_path)) => {
            let code = run_server(config_path).await;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(message) => {
            eprintln!("navigator: {}", message);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: PathBuf) -> i32 {
    init_logging();

    info!(path = %config_path.display(), "Loading configuration");
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to parse configuration");
            return 1;
        }
    };
    info!(
        listen = config.listen,
        tenants = config.tenants.len(),
        rewrites = config.rewrites.len(),
        proxy_routes = config.proxy_routes.len(),
        "Configuration loaded"
    );

    let pid_file = match PidFile::create(Path::new(NAVIGATOR_PID_FILE)) {
        Ok(file) => file,
        Err(e) => {
            error!(path = NAVIGATOR_PID_FILE, error = %e, "Failed to write PID file");
            return 1;
        }
    };

    if let Err(e) = hooks::run_hooks("server.start", &config.hooks.server_start).await {
        error!(error = %e, "server.start hook failed");
        return 1;
    }

    let auth = match BasicAuth::load(&config.auth) {
        Ok(auth) => {
            if auth.is_some() {
                info!("Authentication enabled");
            }
            auth.map(Arc::new)
        }
        Err(e) => {
            warn!(error = %e, "Failed to load auth file, continuing without authentication");
            None
        }
    };

    let supervisor = Arc::new(ProcessSupervisor::new());
    if !config.managed_processes.is_empty() {
        info!(count = config.managed_processes.len(), "Starting managed processes");
        supervisor.start_all(&config.managed_processes);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = BackendPool::new(&config);
    let proxy = Arc::new(RetryingProxy::new());
    let idle = IdleCoordinator::new(&config);
    let router = Router::new(
        Arc::clone(&config),
        auth,
        Arc::clone(&pool),
        Arc::clone(&proxy),
        Arc::clone(&idle),
    );

    let _idle_reaper = pool.spawn_idle_reaper(shutdown_rx.clone());

    let addr: SocketAddr = ([0, 0, 0, 0], config.listen).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind listener");
            return 1;
        }
    };

    let serve_router = Arc::clone(&router);
    let serve_shutdown = shutdown_rx.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = serve_router.serve(listener, serve_shutdown).await {
            error!(error = %e, "Listener error");
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    hooks::run_hooks_logged("server.ready", &config.hooks.server_ready, &HashMap::new()).await;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    reload(&config_path, &router, &pool, &idle, &supervisor).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down");
    }

    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    supervisor.stop_all().await;
    listener_task.abort();

    drop(pid_file);
    if let Err(e) = std::fs::remove_file(NAVIGATOR_PID_FILE) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = NAVIGATOR_PID_FILE, error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    0
}

/// SIGHUP: reparse the config and swap the pieces that can change at
/// runtime. A parse failure keeps everything as it was.
async fn reload(
    config_path: &Path,
    router: &Arc<Router>,
    pool: &Arc<BackendPool>,
    idle: &Arc<IdleCoordinator>,
    supervisor: &Arc<ProcessSupervisor>,
) {
    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration");

    let config = match Config::load(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "Reload failed, keeping previous configuration");
            return;
        }
    };

    match BasicAuth::load(&config.auth) {
        Ok(auth) => router.set_auth(auth.map(Arc::new)),
        Err(e) => warn!(error = %e, "Auth reload failed, keeping previous credentials"),
    }

    pool.update_config(&config);
    idle.update_config(&config);

    supervisor.stop_all().await;
    if !config.managed_processes.is_empty() {
        supervisor.start_all(&config.managed_processes);
    }

    router.set_config(config);
    info!("Configuration reloaded");
}

/// `-s reload`: signal the PID recorded in the fixed PID file.
fn reload_command() -> i32 {
    let contents = match std::fs::read_to_string(NAVIGATOR_PID_FILE) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("navigator: cannot read {}: {}", NAVIGATOR_PID_FILE, e);
            return 1;
        }
    };

    let pid: i32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => {
            eprintln!(
                "navigator: invalid pid '{}' in {}",
                contents.trim(),
                NAVIGATOR_PID_FILE
            );
            return 1;
        }
    };

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid, libc::SIGHUP) };
        if result == 0 {
            println!("Sent SIGHUP to {}", pid);
            0
        } else {
            eprintln!("navigator: failed to signal process {}", pid);
            1
        }
    }

    #[cfg(not(unix))]
    {
        eprintln!("navigator: -s reload is only supported on Unix");
        1
    }
}

/// PID file held with an exclusive lock for the process lifetime, so a
/// second instance fails fast instead of fighting over the listen port.
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("another navigator instance is already running");
            }
            return Err(err.into());
        }

        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config_path() {
        match parse_args(&[]) {
            Ok(Cli::Serve(path)) => assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_PATH)),
            _ => panic!("expected serve with default path"),
        }
    }

    #[test]
    fn test_explicit_config_path() {
        match parse_args(&args(&["/etc/navigator.yml"])) {
            Ok(Cli::Serve(path)) => assert_eq!(path, PathBuf::from("/etc/navigator.yml")),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_reload_flag() {
        assert!(matches!(parse_args(&args(&["-s", "reload"])), Ok(Cli::Reload)));
        assert!(parse_args(&args(&["-s", "restart"])).is_err());
        assert!(parse_args(&args(&["-s"])).is_err());
    }

    #[test]
    fn test_help_flag() {
        assert!(matches!(parse_args(&args(&["--help"])), Ok(Cli::Help)));
        assert!(matches!(parse_args(&args(&["-h"])), Ok(Cli::Help)));
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }
}
