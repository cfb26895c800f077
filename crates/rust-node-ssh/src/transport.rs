//! The transport seam between remote operations and the SSH connection.
//!
//! [`Command`](crate::command::Command), [`File`](crate::file::File),
//! [`Script`](crate::script::Script) and the tunnels never touch russh
//! directly. They borrow a [`Transport`], normally a [`Client`], and talk
//! to remote processes through a pair of queues:
//!
//! - [`ProcessEvent`]s flow from the remote side (stdout and stderr chunks,
//!   exit status).
//! - [`ProcessControl`] messages flow to it (stdin, EOF, signals, close).
//!
//! A single task per process owns the SSH channel and translates between the
//! two, so no channel is ever shared between tasks.

mod auth;
mod client;
mod handler;
mod keepalive;
mod process;
mod retry;
mod sftp;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::tunnel::TunnelAddress;

pub use auth::HostKeyVerification;
pub use client::{Client, ClientBuilder, ConnectionEvent};
pub use keepalive::{KeepaliveConfig, KeepaliveState};
pub use retry::RetryStrategy;

/// Output of a remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of stdout.
    Stdout(Bytes),
    /// A chunk of stderr.
    Stderr(Bytes),
    /// The process exited with this status.
    Exit(u32),
    /// The process was terminated by this signal.
    Signal(String),
}

/// Signals that can be delivered to a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT.
    Interrupt,
    /// SIGKILL.
    Kill,
}

/// Requests for a remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessControl {
    /// Write to stdin.
    Stdin(Bytes),
    /// Send EOF on stdin.
    CloseStdin,
    /// Deliver a signal.
    Signal(Signal),
    /// Close the channel.
    Close,
}

/// Both ends of a started remote process.
///
/// The event queue closes once the process is gone.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Output and exit events.
    pub events: mpsc::Receiver<ProcessEvent>,
    /// Input and signal requests.
    pub control: mpsc::UnboundedSender<ProcessControl>,
}

/// A bidirectional byte stream to a remote endpoint.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// A boxed [`DuplexStream`].
pub type BoxedStream = Box<dyn DuplexStream>;

/// A running remote port forward.
#[derive(Debug)]
pub struct ForwardHandle {
    /// Resolves with a reason when the forward ends on its own. The sender
    /// is dropped without a value when the forward is cancelled.
    pub done: oneshot::Receiver<String>,
    /// Cancel to tear the forward down.
    pub cancel: CancellationToken,
}

/// Kind of a remote filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Anything else (symlink, device, ...).
    Other,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// File name without directory.
    pub name: String,
    /// Entry kind.
    pub kind: RemoteKind,
}

/// File operations on the remote host.
pub trait RemoteFs: Send + Sync {
    /// Kind of `path`, `None` if it does not exist.
    fn stat(&self, path: String) -> BoxFuture<'_, Result<Option<RemoteKind>>>;
    /// Create one directory; existing directories are not an error.
    fn create_dir(&self, path: String) -> BoxFuture<'_, Result<()>>;
    /// Create or truncate `path` with `data`.
    fn write_file(&self, path: String, data: Vec<u8>) -> BoxFuture<'_, Result<()>>;
    /// Read a whole file.
    fn read_file(&self, path: String) -> BoxFuture<'_, Result<Vec<u8>>>;
    /// List a directory, without `.` and `..`.
    fn read_dir(&self, path: String) -> BoxFuture<'_, Result<Vec<RemoteEntry>>>;
    /// Delete a file.
    fn remove_file(&self, path: String) -> BoxFuture<'_, Result<()>>;
}

/// What remote operations need from a connection.
pub trait Transport: Send + Sync {
    /// Address of the host behind this transport.
    fn host(&self) -> String;

    /// Password for sudo prompts.
    fn become_pass(&self) -> Option<String>;

    /// Configuration shared by everything created from this transport.
    fn config(&self) -> &ClientConfig;

    /// Start `command_line` in a new session channel.
    fn exec(&self, command_line: String) -> BoxFuture<'_, Result<ProcessHandle>>;

    /// Open a stream to `host:port` as seen from the remote side.
    fn dial(&self, host: String, port: u16) -> BoxFuture<'_, Result<BoxedStream>>;

    /// Listen on the remote side and forward connections to the local side.
    fn remote_forward(&self, address: TunnelAddress) -> BoxFuture<'_, Result<ForwardHandle>>;

    /// Open a file transfer session.
    fn open_fs(&self) -> BoxFuture<'_, Result<Box<dyn RemoteFs>>>;

    /// Register a proxy (tunnel) to be cancelled when the transport stops.
    fn register_proxy(&self, _token: CancellationToken) {}
}
