//! Managed sidecar processes
//!
//! Commands from the `managed_processes` config section are co-supervised
//! with the server: started at boot (after their `start_delay`), optionally
//! restarted after an unexpected exit, and stopped at shutdown with a grace
//! period before SIGKILL. They never receive proxied traffic.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cooldown before restarting a process that exited unexpectedly.
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL at shutdown.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Configuration for one managed process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ManagedProcessConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_restart: bool,
    /// Seconds to wait before the first spawn.
    #[serde(default)]
    pub start_delay: u64,
}

struct ManagedHandle {
    name: String,
    pid: Arc<Mutex<Option<u32>>>,
    stopping: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Supervises the managed-process set. Replaced wholesale on config reload.
#[derive(Default)]
pub struct ProcessSupervisor {
    handles: Mutex<Vec<ManagedHandle>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every configured process. Each gets its own supervision task.
    pub fn start_all(&self, configs: &[ManagedProcessConfig]) {
        let mut handles = self.handles.lock();
        for config in configs {
            let pid = Arc::new(Mutex::new(None));
            let stopping = Arc::new(AtomicBool::new(false));
            let task = tokio::spawn(supervise(
                config.clone(),
                Arc::clone(&pid),
                Arc::clone(&stopping),
            ));
            handles.push(ManagedHandle {
                name: config.name.clone(),
                pid,
                stopping,
                task,
            });
        }
    }

    /// Number of currently supervised processes.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Stop all processes: SIGTERM, wait up to the grace period, then SIGKILL.
    pub async fn stop_all(&self) {
        let handles: Vec<ManagedHandle> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Stopping managed processes");

        for handle in &handles {
            handle.stopping.store(true, Ordering::SeqCst);
            if let Some(pid) = *handle.pid.lock() {
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        let deadline = Instant::now() + STOP_GRACE;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle.task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(name = %handle.name, "Grace period exceeded, sending SIGKILL");
                    if let Some(pid) = *handle.pid.lock() {
                        #[cfg(unix)]
                        unsafe {
                            libc::kill(pid as i32, libc::SIGKILL);
                        }
                    }
                }
            }
        }
    }
}

async fn supervise(config: ManagedProcessConfig, pid: Arc<Mutex<Option<u32>>>, stopping: Arc<AtomicBool>) {
    if config.start_delay > 0 {
        info!(name = %config.name, delay_secs = config.start_delay, "Delaying process start");
        tokio::time::sleep(Duration::from_secs(config.start_delay)).await;
    }

    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }

        info!(name = %config.name, command = %config.command, args = ?config.args, "Starting managed process");

        let mut child = match spawn_managed(&config) {
            Ok(child) => child,
            Err(e) => {
                error!(name = %config.name, error = %e, "Failed to start managed process");
                return;
            }
        };

        *pid.lock() = child.id();
        pipe_child_output(&config.name, &mut child);

        let status = child.wait().await;
        *pid.lock() = None;

        let clean_exit = matches!(&status, Ok(s) if s.success());
        match &status {
            Ok(s) if s.success() => info!(name = %config.name, "Process exited normally"),
            Ok(s) => warn!(name = %config.name, status = %s, "Process exited with error"),
            Err(e) => warn!(name = %config.name, error = %e, "Error waiting for process"),
        }

        if stopping.load(Ordering::SeqCst) || clean_exit || !config.auto_restart {
            return;
        }

        info!(
            name = %config.name,
            cooldown_secs = RESTART_COOLDOWN.as_secs(),
            "Auto-restarting process"
        );
        tokio::time::sleep(RESTART_COOLDOWN).await;
    }
}

fn spawn_managed(config: &ManagedProcessConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    cmd.spawn()
}

/// Wire a child's stdout/stderr into the log pipeline, labelled by name.
pub(crate) fn pipe_child_output(label: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(source = %label, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(source = %label, "{}", line);
            }
        });
    }
}
