//! Remote port forwarding with health monitoring.
//!
//! A [`ReverseTunnel`] asks the server to listen on `remoteHost:remotePort`
//! and forwards connections back to `localHost:localPort`. Every start gets a
//! fresh invocation id; a task waits for that forward to end and reports the
//! exit tagged with the id, so exits of replaced forwards are told apart from
//! the current one.
//!
//! The health monitor ([`ReverseTunnel::start_health_monitor`]) drives the
//! state machine
//!
//! ```text
//! Stopped -> Starting -> Up -> Degraded -> Restarting -> Up ... -> Stopped
//! ```
//!
//! and hands a [`NodeError::HealthMonitorGaveUp`] back through
//! [`HealthMonitor::wait`] once its restart budget is spent.

mod checker;
mod monitor;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, Result, TunnelError};
use crate::transport::Transport;
use crate::tunnel::TunnelAddress;

pub use checker::{
    ReverseTunnelChecker, ReverseTunnelKiller, RunScriptReverseTunnelChecker,
    RunScriptReverseTunnelKiller,
};

/// Lifecycle state of a reverse tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseTunnelState {
    /// Not running.
    Stopped,
    /// Requesting the remote listener.
    Starting,
    /// Forward established.
    Up,
    /// The last health check failed.
    Degraded,
    /// Tearing down and starting again.
    Restarting,
}

/// A forward that ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TunnelExit {
    id: u64,
    /// `None` when the forward was cancelled locally.
    error: Option<String>,
    /// Whether this was the running forward when it ended. Exits of
    /// forwards already replaced or stopped are stale.
    current: bool,
}

#[derive(Debug)]
struct Invocation {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    transport: Arc<dyn Transport>,
    address: TunnelAddress,
    next_id: AtomicU64,
    /// Guards start, stop and restart so only one runs at a time.
    current: tokio::sync::Mutex<Option<Invocation>>,
    state: watch::Sender<ReverseTunnelState>,
    exits_tx: mpsc::UnboundedSender<TunnelExit>,
    exits_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TunnelExit>>>,
    monitor: Mutex<Option<CancellationToken>>,
}

/// A remote forward back to a local service.
#[derive(Clone)]
pub struct ReverseTunnel {
    inner: Arc<Inner>,
}

impl fmt::Debug for ReverseTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseTunnel")
            .field("address", &self.inner.address.to_string())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReverseTunnel {
    /// Reverse tunnel over `transport`; nothing happens until [`up`](Self::up).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, address: TunnelAddress) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ReverseTunnelState::Stopped);
        Self {
            inner: Arc::new(Inner {
                transport,
                address,
                next_id: AtomicU64::new(1),
                current: tokio::sync::Mutex::new(None),
                state,
                exits_tx,
                exits_rx: Arc::new(tokio::sync::Mutex::new(exits_rx)),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Parse `address` and create the tunnel.
    pub fn parse(transport: Arc<dyn Transport>, address: &str) -> Result<Self> {
        Ok(Self::new(transport, address.parse()?))
    }

    /// The forwarded address.
    #[must_use]
    pub fn address(&self) -> &TunnelAddress {
        &self.inner.address
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ReverseTunnelState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ReverseTunnelState> {
        self.inner.state.subscribe()
    }

    /// Id of the running forward, if any.
    pub async fn invocation_id(&self) -> Option<u64> {
        self.inner.current.lock().await.as_ref().map(|i| i.id)
    }

    /// Establish the remote forward.
    pub async fn up(&self) -> Result<()> {
        let mut current = self.inner.current.lock().await;
        if current.is_some() {
            return Err(TunnelError::AlreadyUp {
                address: self.inner.address.to_string(),
            }
            .into());
        }
        self.inner.start(&mut current).await
    }

    /// Stop the health monitor, then tear the forward down. Safe to call on
    /// a stopped tunnel.
    pub async fn stop(&self) {
        if let Some(monitor) = self.inner.monitor().take() {
            monitor.cancel();
        }
        let mut current = self.inner.current.lock().await;
        if let Some(invocation) = current.take() {
            invocation.cancel.cancel();
            tracing::info!(address = %self.inner.address, id = invocation.id, "Reverse tunnel stopped");
        }
        self.inner.state.send_replace(ReverseTunnelState::Stopped);
    }

    /// Wait for the next forward exit, as a [`TunnelError::Exited`].
    ///
    /// Exits are consumed by the health monitor while it runs; this waits
    /// until the monitor is gone.
    pub async fn next_exit(&self) -> Option<TunnelError> {
        let exit = self.inner.exits_rx.lock().await.recv().await?;
        Some(TunnelError::Exited {
            id: exit.id,
            reason: exit.error.unwrap_or_else(|| "cancelled".to_string()),
        })
    }

    /// Start monitoring with `checker`, restarting through `killer` when
    /// the tunnel fails.
    pub fn start_health_monitor(
        &self,
        checker: Arc<dyn ReverseTunnelChecker>,
        killer: Arc<dyn ReverseTunnelKiller>,
    ) -> Result<HealthMonitor> {
        let cancel = {
            let mut slot = self.inner.monitor();
            if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return Err(TunnelError::MonitorRunning {
                    address: self.inner.address.to_string(),
                }
                .into());
            }
            let cancel = CancellationToken::new();
            *slot = Some(cancel.clone());
            cancel
        };
        tracing::info!(address = %self.inner.address, "Starting reverse tunnel health monitor");
        let handle = tokio::spawn(monitor::run(
            Arc::clone(&self.inner),
            checker,
            killer,
            cancel.clone(),
        ));
        Ok(HealthMonitor { cancel, handle })
    }
}

impl Inner {
    fn monitor(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new forward. The caller holds the `current` lock.
    async fn start(self: &Arc<Self>, current: &mut Option<Invocation>) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.send_replace(ReverseTunnelState::Starting);
        tracing::debug!(address = %self.address, id, "Starting reverse tunnel");

        let handle = match self.transport.remote_forward(self.address.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state.send_replace(ReverseTunnelState::Stopped);
                return Err(e);
            }
        };
        self.transport.register_proxy(handle.cancel.clone());

        let inner = Arc::downgrade(self);
        let done = handle.done;
        tokio::spawn(async move {
            let error = done.await.ok();
            if let Some(inner) = inner.upgrade() {
                inner.forward_ended(id, error).await;
            }
        });

        *current = Some(Invocation {
            id,
            cancel: handle.cancel,
        });
        self.state.send_replace(ReverseTunnelState::Up);
        tracing::info!(address = %self.address, id, "Reverse tunnel up");
        Ok(())
    }

    /// Record the end of forward `id`. A forward that died on its own while
    /// still current is cleared so the tunnel can be brought up again.
    async fn forward_ended(&self, id: u64, error: Option<String>) {
        let mut current = self.current.lock().await;
        let is_current = current.as_ref().is_some_and(|i| i.id == id);
        if let Some(reason) = &error {
            tracing::warn!(address = %self.address, id, reason = %reason, "Reverse tunnel exited");
            if is_current {
                if let Some(invocation) = current.take() {
                    invocation.cancel.cancel();
                }
                let monitored = self.monitor().as_ref().is_some_and(|t| !t.is_cancelled());
                self.state.send_replace(if monitored {
                    ReverseTunnelState::Degraded
                } else {
                    ReverseTunnelState::Stopped
                });
            }
        }
        drop(current);
        let _ = self.exits_tx.send(TunnelExit {
            id,
            error,
            current: is_current,
        });
    }
}

/// A running health monitor.
#[derive(Debug)]
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl HealthMonitor {
    /// Ask the monitor to exit. The tunnel is left as it is.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the monitor task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the monitor to end. Returns
    /// [`NodeError::HealthMonitorGaveUp`] when it ran out of restarts.
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| NodeError::config(format!("health monitor task failed: {e}")))?
    }
}
