//! Checker and killer operations used by the health monitor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::script::Script;
use crate::transport::Transport;
use crate::tunnel::TunnelAddress;

/// Checks that a reverse tunnel carries traffic.
pub trait ReverseTunnelChecker: Send + Sync {
    /// Returns the checker's output on success.
    fn check_tunnel(&self) -> BoxFuture<'_, Result<String>>;
}

/// Kills whatever still holds the remote side of a reverse tunnel.
pub trait ReverseTunnelKiller: Send + Sync {
    /// Returns the killer's output on success.
    fn kill_tunnel(&self) -> BoxFuture<'_, Result<String>>;
}

/// Runs a local script on the remote host under sudo with the tunnel
/// address as its only argument.
#[derive(Clone)]
struct ScriptRunner {
    transport: Arc<dyn Transport>,
    script: PathBuf,
    address: TunnelAddress,
    timeout: Option<Duration>,
}

impl ScriptRunner {
    async fn run(&self) -> Result<String> {
        let mut script = Script::new(
            Arc::clone(&self.transport),
            self.script.clone(),
            [self.address.to_string()],
        )
        .sudo();
        if let Some(timeout) = self.timeout {
            script = script.with_timeout(timeout);
        }
        let stdout = script.execute().await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("script", &self.script)
            .field("address", &self.address.to_string())
            .finish_non_exhaustive()
    }
}

/// Checker backed by a script, typically one that curls `/healthz`
/// through the tunnel.
#[derive(Debug, Clone)]
pub struct RunScriptReverseTunnelChecker {
    runner: ScriptRunner,
}

impl RunScriptReverseTunnelChecker {
    /// Check `address` by running the local `script` remotely.
    pub fn new(transport: Arc<dyn Transport>, script: impl Into<PathBuf>, address: TunnelAddress) -> Self {
        Self {
            runner: ScriptRunner {
                transport,
                script: script.into(),
                address,
                timeout: None,
            },
        }
    }

    /// Kill the script after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner.timeout = Some(timeout);
        self
    }
}

impl ReverseTunnelChecker for RunScriptReverseTunnelChecker {
    fn check_tunnel(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.runner.run())
    }
}

/// Killer backed by a script.
#[derive(Debug, Clone)]
pub struct RunScriptReverseTunnelKiller {
    runner: ScriptRunner,
}

impl RunScriptReverseTunnelKiller {
    /// Clean up `address` by running the local `script` remotely.
    pub fn new(transport: Arc<dyn Transport>, script: impl Into<PathBuf>, address: TunnelAddress) -> Self {
        Self {
            runner: ScriptRunner {
                transport,
                script: script.into(),
                address,
                timeout: None,
            },
        }
    }

    /// Kill the script after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner.timeout = Some(timeout);
        self
    }
}

impl ReverseTunnelKiller for RunScriptReverseTunnelKiller {
    fn kill_tunnel(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.runner.run())
    }
}
