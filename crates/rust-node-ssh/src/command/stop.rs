//! The single stop path shared by `stop`, timeouts and cancellation.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::transport::{ProcessControl, Signal};

/// Why a command was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Manual,
    Timeout,
    Cancelled,
}

#[derive(Debug, Default)]
struct StopState {
    finished: bool,
    stopped_by: Option<StopReason>,
}

/// Interrupt, then kill after a grace period.
///
/// The first caller wins; stopping a finished process does nothing.
#[derive(Debug)]
pub(crate) struct StopControl {
    control: mpsc::UnboundedSender<ProcessControl>,
    state: Mutex<StopState>,
    finished: watch::Sender<bool>,
    grace: Duration,
}

impl StopControl {
    pub(crate) fn new(control: mpsc::UnboundedSender<ProcessControl>, grace: Duration) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            control,
            state: Mutex::new(StopState::default()),
            finished,
            grace,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn stop(&self, reason: StopReason) {
        {
            let mut state = self.lock();
            if state.finished || state.stopped_by.is_some() {
                return;
            }
            state.stopped_by = Some(reason);
        }
        tracing::debug!(?reason, "Stopping remote process");

        let _ = self.control.send(ProcessControl::CloseStdin);
        let _ = self.control.send(ProcessControl::Signal(Signal::Interrupt));

        let mut finished = self.finished.subscribe();
        let exited = tokio::time::timeout(self.grace, finished.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok());
        if !exited {
            tracing::debug!(grace = ?self.grace, "Process ignored SIGINT, killing");
            let _ = self.control.send(ProcessControl::Signal(Signal::Kill));
            let _ = self.control.send(ProcessControl::Close);
        }
    }

    /// Mark the process finished; returns who stopped it, if anyone.
    pub(crate) fn finish(&self) -> Option<StopReason> {
        let stopped_by = {
            let mut state = self.lock();
            state.finished = true;
            state.stopped_by
        };
        self.finished.send_replace(true);
        stopped_by
    }
}

/// Cloneable handle for stopping a started command from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    pub(crate) inner: Arc<StopControl>,
}

impl StopHandle {
    /// Interrupt the remote process, killing it if it does not exit within
    /// the configured grace period.
    pub async fn stop(&self) {
        self.inner.stop(StopReason::Manual).await;
    }
}
