//! Connectivity probe against the current host.

use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::error::{NodeError, Result};
use crate::transport::Transport;

const PROBE_REPLY: &str = "SUCCESS";

/// Checks that commands can be run on the host.
///
/// Retrying is left to the caller.
pub struct Check {
    transport: Arc<dyn Transport>,
    delay: Duration,
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Check")
            .field("host", &self.transport.host())
            .field("delay", &self.delay)
            .finish()
    }
}

impl Check {
    /// Probe over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            delay: Duration::ZERO,
        }
    }

    /// Wait `delay` before probing.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `echo SUCCESS` and verify the reply.
    pub async fn check_availability(&self) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let host = self.transport.host();
        tracing::info!(host = %host, "Checking SSH availability");

        let mut cmd = Command::new(Arc::clone(&self.transport), "echo", [PROBE_REPLY]);
        let (stdout, _) = cmd.output().await?;
        let reply = String::from_utf8_lossy(&stdout);
        if reply.trim() != PROBE_REPLY {
            return Err(NodeError::channel(
                host,
                format!("unexpected availability reply `{}`", reply.trim()),
            ));
        }
        tracing::debug!(host = %host, "SSH available");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTransport, scripts};

    #[tokio::test]
    async fn availability_ok() {
        let transport = Arc::new(FakeTransport::new("node"));
        transport.on_command("echo SUCCESS", scripts::echo("SUCCESS\n"));
        Check::new(transport.clone()).check_availability().await.unwrap();
        assert_eq!(transport.executed(), vec!["echo SUCCESS".to_string()]);
    }

    #[tokio::test]
    async fn unexpected_reply_fails() {
        let transport = Arc::new(FakeTransport::new("node"));
        transport.on_command("echo SUCCESS", scripts::echo("Welcome!\n"));
        let err = Check::new(transport).check_availability().await.unwrap_err();
        assert!(err.to_string().contains("Welcome!"));
    }
}
