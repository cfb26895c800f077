//! Local port forwarding over the SSH connection.
//!
//! A [`Tunnel`] listens on a local address and, for every accepted
//! connection, dials the remote endpoint through the transport and splices
//! the two streams. Per-connection failures go to an error feed; only a
//! failed bind fails [`Tunnel::up`].

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, Result, TunnelError};
use crate::transport::Transport;

/// Capacity of the error feed. Errors beyond it are only logged.
const ERROR_FEED_CAPACITY: usize = 32;

/// `remoteHost:remotePort:localHost:localPort`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddress {
    /// Host as seen from the remote side.
    pub remote_host: String,
    /// Port on the remote side.
    pub remote_port: u16,
    /// Local host.
    pub local_host: String,
    /// Local port.
    pub local_port: u16,
}

impl TunnelAddress {
    /// Build from parts.
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }

    /// `remoteHost:remotePort`.
    #[must_use]
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// `localHost:localPort`.
    #[must_use]
    pub fn local(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.remote_host, self.remote_port, self.local_host, self.local_port
        )
    }
}

impl FromStr for TunnelAddress {
    type Err = TunnelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| TunnelError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = s.split(':').collect();
        let [remote_host, remote_port, local_host, local_port] = parts.as_slice() else {
            return Err(invalid(
                "expected remoteHost:remotePort:localHost:localPort",
            ));
        };
        if remote_host.is_empty() || local_host.is_empty() {
            return Err(invalid("host must not be empty"));
        }
        let remote_port = remote_port
            .parse()
            .map_err(|_| invalid("remote port is not a number in 0..=65535"))?;
        let local_port = local_port
            .parse()
            .map_err(|_| invalid("local port is not a number in 0..=65535"))?;
        Ok(Self::new(*remote_host, remote_port, *local_host, local_port))
    }
}

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// A local forward: `localHost:localPort` to `remoteHost:remotePort`.
pub struct Tunnel {
    transport: Arc<dyn Transport>,
    address: TunnelAddress,
    running: Mutex<Option<Running>>,
    errors_tx: mpsc::Sender<TunnelError>,
    errors_rx: Mutex<Option<mpsc::Receiver<TunnelError>>>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("address", &self.address.to_string())
            .field("up", &self.is_up())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Tunnel over `transport`; nothing is bound until [`up`](Self::up).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, address: TunnelAddress) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_FEED_CAPACITY);
        Self {
            transport,
            address,
            running: Mutex::new(None),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Parse `address` and create the tunnel.
    pub fn parse(transport: Arc<dyn Transport>, address: &str) -> Result<Self> {
        Ok(Self::new(transport, address.parse()?))
    }

    /// The forwarded address.
    #[must_use]
    pub const fn address(&self) -> &TunnelAddress {
        &self.address
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the listener is active. A tunnel whose transport was
    /// stopped is not.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }

    /// Address the listener is bound to (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    /// The error feed. Can be taken once.
    pub fn take_error_feed(&self) -> Option<mpsc::Receiver<TunnelError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Bind the local listener and start forwarding.
    pub async fn up(&self) -> Result<()> {
        if self.is_up() {
            return Err(self.already_up());
        }

        let local = self.address.local();
        let listener = TcpListener::bind(&local)
            .await
            .map_err(|source| TunnelError::Bind {
                address: local.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            address: local.clone(),
            source,
        })?;

        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.cancel.is_cancelled()) {
            return Err(self.already_up());
        }
        let cancel = CancellationToken::new();
        self.transport.register_proxy(cancel.clone());
        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.transport),
            self.address.clone(),
            listener,
            cancel.clone(),
            self.errors_tx.clone(),
        ));
        *running = Some(Running {
            cancel,
            local_addr,
            task,
        });
        drop(running);

        tracing::info!(address = %self.address, local = %local_addr, "Tunnel up");
        Ok(())
    }

    /// Close the listener and every forwarded connection. Safe to call when
    /// the tunnel is not up.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        tracing::info!(address = %self.address, "Tunnel stopped");
    }

    fn already_up(&self) -> NodeError {
        TunnelError::AlreadyUp {
            address: self.address.to_string(),
        }
        .into()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.cancel.cancel();
        }
    }
}

fn report(errors: &mpsc::Sender<TunnelError>, error: TunnelError) {
    tracing::warn!(error = %error, "Tunnel error");
    if errors.try_send(error).is_err() {
        tracing::debug!("Tunnel error feed full, dropping error");
    }
}

async fn accept_loop(
    transport: Arc<dyn Transport>,
    address: TunnelAddress,
    listener: TcpListener,
    cancel: CancellationToken,
    errors: mpsc::Sender<TunnelError>,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, remote = %address.remote(), "Forwarding connection");
                tokio::spawn(forward(
                    Arc::clone(&transport),
                    address.clone(),
                    stream,
                    peer,
                    cancel.child_token(),
                    errors.clone(),
                ));
            }
            Err(e) => report(
                &errors,
                TunnelError::Accept {
                    address: address.local(),
                    reason: e.to_string(),
                },
            ),
        }
    }
}

async fn forward(
    transport: Arc<dyn Transport>,
    address: TunnelAddress,
    mut local: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
    errors: mpsc::Sender<TunnelError>,
) {
    let dialed = tokio::select! {
        () = cancel.cancelled() => return,
        dialed = transport.dial(address.remote_host.clone(), address.remote_port) => dialed,
    };
    let mut remote = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            report(
                &errors,
                TunnelError::Dial {
                    remote: address.remote(),
                    reason: e.to_string(),
                },
            );
            return;
        }
    };

    tokio::select! {
        () = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((sent, received)) => {
                tracing::debug!(peer = %peer, sent, received, "Forwarded connection closed");
            }
            Err(e) => report(
                &errors,
                TunnelError::Copy {
                    local: peer.to_string(),
                    remote: address.remote(),
                    reason: e.to_string(),
                },
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address() {
        let address: TunnelAddress = "127.0.0.1:6445:localhost:22322".parse().unwrap();
        assert_eq!(address.remote(), "127.0.0.1:6445");
        assert_eq!(address.local(), "localhost:22322");
        assert_eq!(address.to_string(), "127.0.0.1:6445:localhost:22322");
    }

    #[test]
    fn reject_malformed_addresses() {
        for bad in [
            "",
            "127.0.0.1:6445",
            "a:1:b",
            "a:1:b:2:c",
            ":1:b:2",
            "a:x:b:2",
            "a:1:b:70000",
        ] {
            let err = bad.parse::<TunnelAddress>().unwrap_err();
            assert!(
                matches!(err, TunnelError::InvalidAddress { .. }),
                "{bad}: {err}"
            );
        }
    }
}
