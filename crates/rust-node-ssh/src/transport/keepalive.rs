//! SSH keepalive management.
//!
//! Each [`Client`](super::Client) runs exactly one keep-alive task. On a
//! fixed interval it probes the connection (a throwaway session plus an
//! OpenSSH `keepalive@openssh.com` request). Once `max_missed` probes in a
//! row fail the task reports the connection as lost and exits; it never
//! reconnects by itself.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// The two halves of a keep-alive probe.
pub(crate) trait KeepaliveTarget: Send + Sync {
    /// Open a session channel and close it again.
    fn open_throwaway(&self) -> BoxFuture<'_, Result<()>>;

    /// Send `keepalive@openssh.com` asking for a reply.
    fn request_keepalive(&self) -> BoxFuture<'_, Result<()>>;
}

/// Probe `target` once: throwaway session first, then the keep-alive
/// request.
pub(crate) async fn probe<T: KeepaliveTarget + ?Sized>(target: &T) -> Result<()> {
    target.open_throwaway().await?;
    target.request_keepalive().await
}

/// Keepalive configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Probes allowed to fail in a row before the connection is lost.
    pub max_missed: u32,
    /// Enable keepalive.
    pub enabled: bool,
    /// Timeout for each probe.
    pub response_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_missed: 1,
            enabled: true,
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl KeepaliveConfig {
    /// Create new config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set interval between probes.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set how many failed probes in a row mean the connection is gone.
    #[must_use]
    pub const fn max_missed(mut self, max: u32) -> Self {
        self.max_missed = max;
        self
    }

    /// Enable or disable keepalive.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set response timeout for each probe.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Create a disabled keepalive config.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Keepalive state tracking.
#[derive(Debug)]
pub struct KeepaliveState {
    config: KeepaliveConfig,
    missed_count: u32,
    last_success: Option<Instant>,
    last_error: Option<String>,
}

impl KeepaliveState {
    /// Create new state.
    #[must_use]
    pub const fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            missed_count: 0,
            last_success: None,
            last_error: None,
        }
    }

    /// Record a probe that got an answer.
    pub fn record_success(&mut self) {
        self.missed_count = 0;
        self.last_success = Some(Instant::now());
        self.last_error = None;
    }

    /// Record a failed probe.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.missed_count = self.missed_count.saturating_add(1);
        self.last_error = Some(reason.into());
    }

    /// Whether the connection should still be considered alive.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        let limit = if self.config.max_missed == 0 {
            1
        } else {
            self.config.max_missed
        };
        self.missed_count < limit
    }

    /// Consecutive failed probes.
    #[must_use]
    pub const fn missed_count(&self) -> u32 {
        self.missed_count
    }

    /// Time of the last successful probe.
    #[must_use]
    pub const fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Reason of the last failed probe.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Probe the connection until it is lost or `cancel` fires.
///
/// Returns the failure reason when the connection is lost, `None` when
/// cancelled.
pub(crate) async fn watch<P, Fut>(
    config: KeepaliveConfig,
    cancel: CancellationToken,
    mut probe: P,
) -> Option<String>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut state = KeepaliveState::new(config.clone());
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => return None,
            outcome = tokio::time::timeout(config.response_timeout, probe()) => outcome,
        };

        match outcome {
            Ok(Ok(())) => state.record_success(),
            Ok(Err(e)) => state.record_failure(e.to_string()),
            Err(_) => state.record_failure(format!(
                "no keep-alive reply within {:?}",
                config.response_timeout
            )),
        }

        if !state.is_alive() {
            return state.last_error().map(str::to_string);
        }
        if let Some(reason) = state.last_error() {
            tracing::warn!(
                missed = state.missed_count(),
                reason,
                "Keep-alive probe failed"
            );
        }
    }
}
