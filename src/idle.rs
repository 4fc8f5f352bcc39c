//! Machine idle coordinator
//!
//! Counts in-flight requests. When the count drops to zero a one-shot timer
//! is armed; if it fires, the server-idle hooks run and the platform
//! machines API is asked to suspend or stop this machine. Any new request
//! disarms the timer. One lock covers the counter, the last-activity
//! timestamp, and the timer handle together.

use crate::config::{Config, IdleAction};
use crate::error::NavigatorError;
use crate::hooks::{run_hooks_logged, Hook};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Unix socket the platform machines API listens on.
const FLY_API_SOCKET: &str = "/.fly/api";

/// Deadline for the machines API call.
const API_DEADLINE: Duration = Duration::from_secs(10);

struct IdleState {
    action: Option<IdleAction>,
    timeout: Duration,
    idle_hooks: Vec<Hook>,
    active: usize,
    last_zero: Instant,
    timer: Option<JoinHandle<()>>,
}

/// Process-wide idle tracking. Lives for the process lifetime.
pub struct IdleCoordinator {
    state: Mutex<IdleState>,
}

impl IdleCoordinator {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IdleState {
                action: config.idle_action,
                timeout: config.idle_timeout,
                idle_hooks: config.hooks.server_idle.clone(),
                active: 0,
                last_zero: Instant::now(),
                timer: None,
            }),
        })
    }

    pub fn active_requests(&self) -> usize {
        self.state.lock().active
    }

    /// Whether the idle timer is currently armed.
    pub fn timer_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Count a request in and return a guard that counts it back out.
    pub fn track(self: &Arc<Self>) -> IdleGuard {
        self.request_started();
        IdleGuard {
            coordinator: Arc::clone(self),
        }
    }

    pub fn request_started(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.active += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn request_finished(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.last_zero = Instant::now();
            arm_timer(self, &mut state);
        }
    }

    /// Swap action, timeout, and hooks; re-arm only if already idle.
    pub fn update_config(self: &Arc<Self>, config: &Config) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.action = config.idle_action;
        state.timeout = config.idle_timeout;
        state.idle_hooks = config.hooks.server_idle.clone();
        if state.active == 0 {
            arm_timer(self, &mut state);
        }
    }

    async fn fire(self: Arc<Self>) {
        let (action, hooks) = {
            let mut state = self.state.lock();
            state.timer = None;
            if state.active != 0 {
                return;
            }
            let Some(action) = state.action else { return };
            (action, state.idle_hooks.clone())
        };

        info!(action = action.as_str(), "Server idle, running idle action");
        run_hooks_logged("server.idle", &hooks, &HashMap::new()).await;

        match invoke_machine_action(action).await {
            Ok(()) => info!(action = action.as_str(), "Machine idle action accepted"),
            Err(e) => warn!(error = %e, "Machine idle action failed"),
        }
    }
}

/// Arm the one-shot idle timer. Caller holds the state lock.
fn arm_timer(coordinator: &Arc<IdleCoordinator>, state: &mut IdleState) {
    if state.action.is_none() {
        return;
    }
    let timeout = state.timeout;
    let this = Arc::clone(coordinator);
    debug!(timeout_secs = timeout.as_secs(), "Arming idle timer");
    state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        this.fire().await;
    }));
}

/// RAII pairing for request accounting; dropping the guard is the
/// "request finished" event.
pub struct IdleGuard {
    coordinator: Arc<IdleCoordinator>,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.coordinator.request_finished();
    }
}

/// POST the idle action to the machines API over its Unix socket.
async fn invoke_machine_action(action: IdleAction) -> Result<(), NavigatorError> {
    let app = std::env::var("FLY_APP_NAME")
        .map_err(|_| NavigatorError::PlatformApi("FLY_APP_NAME not set".to_string()))?;
    let machine = std::env::var("FLY_MACHINE_ID")
        .map_err(|_| NavigatorError::PlatformApi("FLY_MACHINE_ID not set".to_string()))?;

    let request = format!(
        "POST /v1/apps/{}/machines/{}/{} HTTP/1.1\r\nHost: flaps\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        app,
        machine,
        action.as_str()
    );

    let exchange = async {
        let mut stream = tokio::net::UnixStream::connect(FLY_API_SOCKET).await?;
        stream.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    };

    let status_line = tokio::time::timeout(API_DEADLINE, exchange)
        .await
        .map_err(|_| NavigatorError::PlatformApi("machines API call timed out".to_string()))?
        .map_err(|e| NavigatorError::PlatformApi(e.to_string()))?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(code) => Err(NavigatorError::PlatformApi(format!(
            "machines API returned {}",
            code
        ))),
        None => Err(NavigatorError::PlatformApi(format!(
            "unparsable machines API response '{}'",
            status_line.trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_action(timeout_secs: u64) -> Config {
        let yaml = format!(
            "server:\n  idle:\n    action: suspend\n    timeout: {}\n",
            timeout_secs
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_counter_balance() {
        let coordinator = IdleCoordinator::new(&Config::from_yaml("{}").unwrap());
        assert_eq!(coordinator.active_requests(), 0);

        {
            let _a = coordinator.track();
            let _b = coordinator.track();
            assert_eq!(coordinator.active_requests(), 2);
        }
        assert_eq!(coordinator.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_timer_armed_only_with_action() {
        // No idle action configured: never arm.
        let plain = IdleCoordinator::new(&Config::from_yaml("{}").unwrap());
        drop(plain.track());
        assert!(!plain.timer_armed());

        // With an action, reaching zero arms the timer.
        let with_action = IdleCoordinator::new(&config_with_action(3600));
        drop(with_action.track());
        assert!(with_action.timer_armed());
    }

    #[tokio::test]
    async fn test_new_request_disarms_timer() {
        let coordinator = IdleCoordinator::new(&config_with_action(3600));
        drop(coordinator.track());
        assert!(coordinator.timer_armed());

        let guard = coordinator.track();
        assert!(!coordinator.timer_armed());
        drop(guard);
        assert!(coordinator.timer_armed());
    }

    #[tokio::test]
    async fn test_update_config_rearms_when_idle() {
        let coordinator = IdleCoordinator::new(&Config::from_yaml("{}").unwrap());
        drop(coordinator.track());
        assert!(!coordinator.timer_armed());

        coordinator.update_config(&config_with_action(3600));
        assert!(coordinator.timer_armed());

        // Removing the action disarms again.
        coordinator.update_config(&Config::from_yaml("{}").unwrap());
        assert!(!coordinator.timer_armed());
    }

    #[tokio::test]
    async fn test_timer_does_not_fire_while_busy() {
        let coordinator = IdleCoordinator::new(&config_with_action(0));
        let _guard = coordinator.track();

        // The guard is live; nothing to arm and nothing fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!coordinator.timer_armed());
        assert_eq!(coordinator.active_requests(), 1);
    }

    #[tokio::test]
    async fn test_machine_action_requires_env() {
        // FLY_APP_NAME / FLY_MACHINE_ID are not set in the test environment.
        let result = invoke_machine_action(IdleAction::Suspend).await;
        assert!(matches!(result, Err(NavigatorError::PlatformApi(_))));
    }
}
