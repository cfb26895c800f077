//! Health monitor loop.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::checker::{ReverseTunnelChecker, ReverseTunnelKiller};
use super::{Inner, ReverseTunnelState, TunnelExit};
use crate::error::{NodeError, Result};

enum Wake {
    Cancelled,
    Tick,
    Exit(TunnelExit),
}

pub(super) async fn run(
    inner: Arc<Inner>,
    checker: Arc<dyn ReverseTunnelChecker>,
    killer: Arc<dyn ReverseTunnelKiller>,
    cancel: CancellationToken,
) -> Result<()> {
    // Frees the monitor slot however the loop ends.
    let _slot = cancel.clone().drop_guard();
    let config = inner.transport.config().health;
    let mut exits = Arc::clone(&inner.exits_rx).lock_owned().await;
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut restarts = 0u32;
    loop {
        let wake = tokio::select! {
            () = cancel.cancelled() => Wake::Cancelled,
            _ = ticker.tick() => Wake::Tick,
            Some(exit) = exits.recv() => Wake::Exit(exit),
        };

        let reason = match wake {
            Wake::Cancelled => break,
            Wake::Tick => {
                let checked = tokio::select! {
                    () = cancel.cancelled() => break,
                    checked = check(&inner, checker.as_ref()) => checked,
                };
                match checked {
                    Ok(()) => {
                        restarts = 0;
                        continue;
                    }
                    Err(reason) => reason,
                }
            }
            Wake::Exit(exit) => {
                let Some(error) = exit.error.filter(|_| exit.current) else {
                    tracing::debug!(id = exit.id, "Ignoring exit of replaced reverse tunnel");
                    continue;
                };
                format!("tunnel exited: {error}")
            }
        };

        restarts += 1;
        if restarts > config.max_restarts {
            tracing::error!(
                address = %inner.address,
                restarts = config.max_restarts,
                "Reverse tunnel keeps failing, giving up"
            );
            return Err(NodeError::HealthMonitorGaveUp {
                address: inner.address.to_string(),
                restarts: config.max_restarts,
            });
        }
        tracing::warn!(address = %inner.address, restart = restarts, reason = %reason, "Restarting reverse tunnel");
        if let Err(e) = restart(&inner, killer.as_ref(), &cancel).await {
            tracing::warn!(address = %inner.address, error = %e, "Reverse tunnel restart failed");
        }
    }

    tracing::info!(address = %inner.address, "Reverse tunnel health monitor stopped");
    Ok(())
}

/// Run the checker up to `check_retries` times. A missing forward fails
/// without asking the checker.
async fn check(inner: &Inner, checker: &dyn ReverseTunnelChecker) -> std::result::Result<(), String> {
    if inner.current.lock().await.is_none() {
        return Err("tunnel is not up".to_string());
    }

    let config = inner.transport.config().health;
    let attempts = config.check_retries.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match checker.check_tunnel().await {
            Ok(output) => {
                tracing::debug!(address = %inner.address, output = %output.trim_end(), "Reverse tunnel healthy");
                if *inner.state.borrow() == ReverseTunnelState::Degraded {
                    inner.state.send_replace(ReverseTunnelState::Up);
                }
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(address = %inner.address, attempt, error = %e, "Reverse tunnel check failed");
                last = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    inner.state.send_replace(ReverseTunnelState::Degraded);
    Err(format!("health check failed {attempts} times: {last}"))
}

/// Cancel the current forward, kill leftovers on the remote side and start
/// again, all under the `current` lock.
async fn restart(
    inner: &Arc<Inner>,
    killer: &dyn ReverseTunnelKiller,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut current = inner.current.lock().await;
    if cancel.is_cancelled() {
        return Ok(());
    }
    inner.state.send_replace(ReverseTunnelState::Restarting);
    if let Some(invocation) = current.take() {
        invocation.cancel.cancel();
    }

    match killer.kill_tunnel().await {
        Ok(output) => tracing::debug!(address = %inner.address, output = %output.trim_end(), "Killed remote tunnel leftovers"),
        Err(e) => tracing::warn!(address = %inner.address, error = %e, "Killing remote tunnel leftovers failed"),
    }

    inner.start(&mut current).await
}
