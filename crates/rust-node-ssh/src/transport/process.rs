//! One task per remote process: owns the channel, speaks the queue protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ProcessControl, ProcessEvent, ProcessHandle, Signal};

/// Capacity of the per-process event queue.
const EVENT_QUEUE: usize = 64;

#[derive(Debug)]
struct Shell {
    control: mpsc::UnboundedSender<ProcessControl>,
    pump: JoinHandle<()>,
}

/// Every open remote shell with the task pumping its channel, so `stop`
/// can close them and wait for the channels to go.
#[derive(Debug, Default)]
pub(crate) struct ShellRegistry {
    next_id: AtomicU64,
    shells: Mutex<HashMap<u64, Shell>>,
}

impl ShellRegistry {
    /// Register a shell whose pump is started by `spawn`. The pump can
    /// only unregister itself once it is recorded.
    fn register(
        &self,
        control: mpsc::UnboundedSender<ProcessControl>,
        spawn: impl FnOnce(u64) -> JoinHandle<()>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut shells = self.lock();
        let pump = spawn(id);
        shells.insert(id, Shell { control, pump });
        id
    }

    fn unregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Number of shells still open.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Ask every open shell to close its channel. Returns their pump tasks.
    pub(crate) fn close_all(&self) -> Vec<JoinHandle<()>> {
        let shells: Vec<_> = self.lock().drain().map(|(_, shell)| shell).collect();
        if !shells.is_empty() {
            tracing::debug!(count = shells.len(), "Closing remote shells");
        }
        shells
            .into_iter()
            .map(|shell| {
                let _ = shell.control.send(ProcessControl::Close);
                shell.pump
            })
            .collect()
    }

    /// Close every open shell and wait up to `within` for the channels to
    /// be closed.
    pub(crate) async fn shutdown(&self, within: Duration) {
        let pumps = self.close_all();
        if pumps.is_empty() {
            return;
        }
        let count = pumps.len();
        if tokio::time::timeout(within, futures::future::join_all(pumps))
            .await
            .is_err()
        {
            tracing::warn!(count, ?within, "Remote shells did not close in time");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Shell>> {
        self.shells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const fn to_sig(signal: Signal) -> Sig {
    match signal {
        Signal::Interrupt => Sig::INT,
        Signal::Kill => Sig::KILL,
    }
}

/// Spawn the task that owns `channel` and return the caller's end.
pub(crate) fn spawn(channel: Channel<Msg>, shells: Arc<ShellRegistry>, host: String) -> ProcessHandle {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let registry = Arc::clone(&shells);
    shells.register(control_tx.clone(), move |id| {
        tokio::spawn(async move {
            pump(channel, events_tx, control_rx, &host).await;
            registry.unregister(id);
        })
    });

    ProcessHandle {
        events: events_rx,
        control: control_tx,
    }
}

async fn pump(
    mut channel: Channel<Msg>,
    events: mpsc::Sender<ProcessEvent>,
    mut control: mpsc::UnboundedReceiver<ProcessControl>,
    host: &str,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => {
                let event = match msg {
                    None | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Data { data }) => ProcessEvent::Stdout(Bytes::copy_from_slice(&data)),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        ProcessEvent::Stderr(Bytes::copy_from_slice(&data))
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => ProcessEvent::Exit(exit_status),
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        ProcessEvent::Signal(format!("{signal_name:?}"))
                    }
                    Some(_) => continue,
                };
                if events.send(event).await.is_err() {
                    // Nobody is listening any more.
                    let _ = channel.close().await;
                    break;
                }
            }
            request = control.recv() => {
                let Some(request) = request else {
                    let _ = channel.close().await;
                    break;
                };
                let result = match request {
                    ProcessControl::Stdin(bytes) => channel.data(&bytes[..]).await,
                    ProcessControl::CloseStdin => channel.eof().await,
                    ProcessControl::Signal(signal) => channel.signal(to_sig(signal)).await,
                    ProcessControl::Close => {
                        let _ = channel.close().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(host, error = %e, "Channel request failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    /// A pump stand-in that ends `delay` after it is told to close.
    fn fake_pump(
        mut control: mpsc::UnboundedReceiver<ProcessControl>,
        delay: Duration,
        closed: Arc<AtomicBool>,
    ) -> impl FnOnce(u64) -> JoinHandle<()> {
        move |_| {
            tokio::spawn(async move {
                while let Some(request) = control.recv().await {
                    if request == ProcessControl::Close {
                        tokio::time::sleep(delay).await;
                        closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn close_all_sends_close_and_empties() {
        let registry = ShellRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(tx, |_| tokio::spawn(async {}));
        assert_eq!(registry.len(), 1);
        let pumps = registry.close_all();
        assert_eq!(pumps.len(), 1);
        assert_eq!(registry.len(), 0);
        assert_eq!(rx.try_recv().unwrap(), ProcessControl::Close);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = ShellRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.register(tx.clone(), |_| tokio::spawn(async {}));
        let b = registry.register(tx, |_| tokio::spawn(async {}));
        assert_ne!(a, b);
        registry.unregister(a);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_channels_to_close() {
        let registry = ShellRegistry::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(tx, fake_pump(rx, Duration::from_millis(30), Arc::clone(&closed)));

        registry.shutdown(Duration::from_secs(5)).await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_bounded() {
        let registry = ShellRegistry::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(tx, fake_pump(rx, Duration::from_secs(60), Arc::clone(&closed)));

        let started = Instant::now();
        registry.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[test]
    fn signals_map_to_ssh_names() {
        assert!(matches!(to_sig(Signal::Interrupt), Sig::INT));
        assert!(matches!(to_sig(Signal::Kill), Sig::KILL));
    }
}
