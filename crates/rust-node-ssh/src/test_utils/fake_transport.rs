//! Fake transport with scripted remote processes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::memory_fs::MemoryFs;
use crate::config::ClientConfig;
use crate::error::{NodeError, Result};
use crate::transport::{
    BoxedStream, ForwardHandle, ProcessControl, ProcessEvent, ProcessHandle, RemoteFs, Transport,
};
use crate::tunnel::TunnelAddress;

/// Behaviour of one fake remote process.
pub type FakeScript = Arc<dyn Fn(FakeProcessIo) -> BoxFuture<'static, ()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The remote side of a fake process, as seen by its script.
///
/// Dropping it ends the process, like a closed channel.
#[derive(Debug)]
pub struct FakeProcessIo {
    command: String,
    events: mpsc::Sender<ProcessEvent>,
    control: mpsc::UnboundedReceiver<ProcessControl>,
    log: Arc<Mutex<Vec<ProcessControl>>>,
    stdin: Vec<u8>,
}

impl FakeProcessIo {
    /// The full command line the process was started with.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Write to stdout.
    pub async fn stdout(&self, text: &str) {
        let _ = self
            .events
            .send(ProcessEvent::Stdout(Bytes::copy_from_slice(text.as_bytes())))
            .await;
    }

    /// Write to stderr.
    pub async fn stderr(&self, text: &str) {
        let _ = self
            .events
            .send(ProcessEvent::Stderr(Bytes::copy_from_slice(text.as_bytes())))
            .await;
    }

    /// Exit with `status`.
    pub async fn exit(self, status: u32) {
        let _ = self.events.send(ProcessEvent::Exit(status)).await;
    }

    /// Die from `signal`.
    pub async fn killed(self, signal: &str) {
        let _ = self
            .events
            .send(ProcessEvent::Signal(signal.to_string()))
            .await;
    }

    /// Next control message, recorded in the transport's log. `None` once
    /// the local side is gone.
    pub async fn next_control(&mut self) -> Option<ProcessControl> {
        let control = self.control.recv().await?;
        lock(&self.log).push(control.clone());
        Some(control)
    }

    /// Read one line of stdin without the newline. `None` on EOF, close or
    /// a signal.
    pub async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.stdin.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.stdin.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            match self.next_control().await? {
                ProcessControl::Stdin(data) => self.stdin.extend_from_slice(&data),
                ProcessControl::CloseStdin | ProcessControl::Close | ProcessControl::Signal(_) => {
                    return None;
                }
            }
        }
    }
}

struct ForwardRecord {
    address: TunnelAddress,
    cancel: CancellationToken,
    done: Option<oneshot::Sender<String>>,
}

/// Hands out fake remote forwards and lets tests end them.
#[derive(Default)]
pub struct FakeForwarder {
    records: Arc<Mutex<Vec<ForwardRecord>>>,
    fail: AtomicBool,
}

impl std::fmt::Debug for FakeForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeForwarder")
            .field("requested", &self.requested())
            .field("active", &self.active())
            .finish()
    }
}

impl FakeForwarder {
    /// Make the following requests fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of forwards requested so far, failed ones excluded.
    #[must_use]
    pub fn requested(&self) -> usize {
        lock(&self.records).len()
    }

    /// Forwards neither cancelled nor ended.
    #[must_use]
    pub fn active(&self) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.done.is_some() && !r.cancel.is_cancelled())
            .count()
    }

    /// Addresses of every forward requested.
    #[must_use]
    pub fn addresses(&self) -> Vec<TunnelAddress> {
        lock(&self.records)
            .iter()
            .map(|r| r.address.clone())
            .collect()
    }

    /// End the newest active forward as if the server dropped it.
    pub fn end_latest(&self, reason: &str) -> bool {
        let mut records = lock(&self.records);
        let Some(record) = records
            .iter_mut()
            .rev()
            .find(|r| r.done.is_some() && !r.cancel.is_cancelled())
        else {
            return false;
        };
        if let Some(done) = record.done.take() {
            let _ = done.send(reason.to_string());
        }
        true
    }

    fn open(&self, address: TunnelAddress) -> Result<ForwardHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NodeError::channel(
                "fake",
                format!("remote forward {address} refused"),
            ));
        }
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let index = {
            let mut records = lock(&self.records);
            records.push(ForwardRecord {
                address,
                cancel: cancel.clone(),
                done: Some(done_tx),
            });
            records.len() - 1
        };

        let records = Arc::clone(&self.records);
        let token = cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let done = lock(&records).get_mut(index).and_then(|r| r.done.take());
            drop(done);
        });

        Ok(ForwardHandle {
            done: done_rx,
            cancel,
        })
    }
}

/// A [`Transport`] for tests.
pub struct FakeTransport {
    host: String,
    become_pass: Option<String>,
    config: ClientConfig,
    scripts: Mutex<Vec<(String, FakeScript)>>,
    executed: Mutex<Vec<String>>,
    controls: Arc<Mutex<Vec<ProcessControl>>>,
    dials: Mutex<Vec<SocketAddr>>,
    proxies: Mutex<Vec<CancellationToken>>,
    fs: MemoryFs,
    forwarder: FakeForwarder,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    /// Fake connection to `host` with default configuration.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            become_pass: None,
            config: ClientConfig::default(),
            scripts: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            controls: Arc::default(),
            dials: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
            fs: MemoryFs::new(),
            forwarder: FakeForwarder::default(),
        }
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Answer sudo prompts with `pass`.
    #[must_use]
    pub fn with_become_pass(mut self, pass: impl Into<String>) -> Self {
        self.become_pass = Some(pass.into());
        self
    }

    /// Run `script` for command lines containing `pattern`. Later
    /// registrations win. Unmatched commands exit 0 without output.
    pub fn on_command(&self, pattern: impl Into<String>, script: FakeScript) {
        lock(&self.scripts).push((pattern.into(), script));
    }

    /// Command lines executed so far.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    /// Control messages the fake processes have read.
    #[must_use]
    pub fn controls(&self) -> Vec<ProcessControl> {
        lock(&self.controls).clone()
    }

    /// Addresses dialed so far.
    #[must_use]
    pub fn dials(&self) -> Vec<SocketAddr> {
        lock(&self.dials).clone()
    }

    /// The remote filesystem.
    #[must_use]
    pub const fn fs(&self) -> &MemoryFs {
        &self.fs
    }

    /// The remote forward source.
    #[must_use]
    pub const fn forwarder(&self) -> &FakeForwarder {
        &self.forwarder
    }

    /// Registered proxies not yet cancelled.
    #[must_use]
    pub fn live_proxies(&self) -> usize {
        lock(&self.proxies)
            .iter()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    /// Cancel every registered proxy, as stopping a client does.
    pub fn cancel_proxies(&self) {
        for token in lock(&self.proxies).drain(..) {
            token.cancel();
        }
    }

    fn script_for(&self, command_line: &str) -> Option<FakeScript> {
        lock(&self.scripts)
            .iter()
            .rev()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, script)| Arc::clone(script))
    }
}

impl Transport for FakeTransport {
    fn host(&self) -> String {
        self.host.clone()
    }

    fn become_pass(&self) -> Option<String> {
        self.become_pass.clone()
    }

    fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn exec(&self, command_line: String) -> BoxFuture<'_, Result<ProcessHandle>> {
        Box::pin(async move {
            lock(&self.executed).push(command_line.clone());
            let script = self.script_for(&command_line);

            let (events_tx, events_rx) = mpsc::channel(64);
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let io = FakeProcessIo {
                command: command_line,
                events: events_tx,
                control: control_rx,
                log: Arc::clone(&self.controls),
                stdin: Vec::new(),
            };
            match script {
                Some(script) => {
                    tokio::spawn(script(io));
                }
                None => {
                    tokio::spawn(io.exit(0));
                }
            }
            Ok(ProcessHandle {
                events: events_rx,
                control: control_tx,
            })
        })
    }

    fn dial(&self, host: String, port: u16) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| NodeError::channel(&self.host, format!("dial {host}:{port}: {e}")))?;
            if let Ok(peer) = stream.peer_addr() {
                lock(&self.dials).push(peer);
            }
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn remote_forward(&self, address: TunnelAddress) -> BoxFuture<'_, Result<ForwardHandle>> {
        Box::pin(async move { self.forwarder.open(address) })
    }

    fn open_fs(&self) -> BoxFuture<'_, Result<Box<dyn RemoteFs>>> {
        let fs: Box<dyn RemoteFs> = Box::new(self.fs.clone());
        Box::pin(std::future::ready(Ok(fs)))
    }

    fn register_proxy(&self, token: CancellationToken) {
        lock(&self.proxies).push(token);
    }
}
