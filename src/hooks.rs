//! Lifecycle hook execution
//!
//! Hooks are short-lived external commands run at fixed points in the server
//! and tenant lifecycle (server start/ready/idle, tenant start/stop). Each
//! hook may carry its own timeout; a hook that exceeds it is killed.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// A single lifecycle hook command.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Hook {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout in seconds. No timeout when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Hook {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Hook lists grouped by lifecycle event.
#[derive(Debug, Clone, Default)]
pub struct LifecycleHooks {
    pub server_start: Vec<Hook>,
    pub server_ready: Vec<Hook>,
    pub server_idle: Vec<Hook>,
    pub tenant_start: Vec<Hook>,
    pub tenant_stop: Vec<Hook>,
}

/// Run a hook list, stopping at the first failure.
///
/// Used for `server.start` where a failure aborts startup.
pub async fn run_hooks(event: &str, hooks: &[Hook]) -> anyhow::Result<()> {
    run_hooks_with_env(event, hooks, &HashMap::new()).await
}

/// Run a hook list with extra environment variables, stopping at the first failure.
pub async fn run_hooks_with_env(
    event: &str,
    hooks: &[Hook],
    env: &HashMap<String, String>,
) -> anyhow::Result<()> {
    for hook in hooks {
        run_hook(event, hook, env).await?;
    }
    Ok(())
}

/// Run a hook list, logging failures without propagating them.
///
/// Used for every event other than `server.start`.
pub async fn run_hooks_logged(event: &str, hooks: &[Hook], env: &HashMap<String, String>) {
    for hook in hooks {
        if let Err(e) = run_hook(event, hook, env).await {
            error!(event, command = %hook.command, error = %e, "Hook failed");
        }
    }
}

async fn run_hook(event: &str, hook: &Hook, env: &HashMap<String, String>) -> anyhow::Result<()> {
    info!(event, command = %hook.command, args = ?hook.args, "Running hook");

    let mut cmd = Command::new(&hook.command);
    cmd.args(&hook.args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.kill_on_drop(true);

    let run = async {
        let status = cmd.status().await?;
        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("hook '{}' exited with {}", hook.command, status)
        }
    };

    match hook.timeout_duration() {
        Some(timeout) => match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event, command = %hook.command, timeout_secs = hook.timeout, "Hook timed out");
                anyhow::bail!("hook '{}' timed out", hook.command)
            }
        },
        None => run.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(command: &str, args: &[&str]) -> Hook {
        Hook {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_successful_hook() {
        let hooks = vec![hook("true", &[])];
        assert!(run_hooks("server.start", &hooks).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_hook_propagates() {
        let hooks = vec![hook("false", &[])];
        assert!(run_hooks("server.start", &hooks).await.is_err());
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        // "false" fails, so the second hook (which would also fail if it ran
        // with a bogus path) is never the error we see.
        let hooks = vec![hook("false", &[]), hook("/nonexistent/hook", &[])];
        let err = run_hooks("server.start", &hooks).await.unwrap_err();
        assert!(err.to_string().contains("false"));
    }

    #[tokio::test]
    async fn test_hook_timeout() {
        let slow = Hook {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            timeout: Some(1),
        };
        let err = run_hooks("tenant.start", &[slow]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_logged_hooks_do_not_propagate() {
        let hooks = vec![hook("false", &[]), hook("true", &[])];
        // Must not panic or return an error.
        run_hooks_logged("server.ready", &hooks, &HashMap::new()).await;
    }

    #[tokio::test]
    async fn test_hook_env_passed() {
        let mut env = HashMap::new();
        env.insert("HOOK_CHECK".to_string(), "1".to_string());
        let probe = hook("sh", &["-c", "test \"$HOOK_CHECK\" = 1"]);
        assert!(run_hooks_with_env("tenant.start", &[probe], &env).await.is_ok());
    }
}
