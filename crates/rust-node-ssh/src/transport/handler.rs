//! russh client handler: host key policy and reverse-forward routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use russh::Channel;
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use tokio::sync::oneshot;

use super::HostKeyVerification;

/// Where connections arriving on a remote-forwarded port go.
#[derive(Debug)]
pub(crate) struct ForwardRoute {
    /// Local `host:port` to connect to.
    pub(crate) target: String,
    /// Fired when the forward dies with the connection.
    pub(crate) done: Option<oneshot::Sender<String>>,
}

/// Remote port to local target, shared between the client and its handler.
#[derive(Debug, Default)]
pub(crate) struct ForwardRegistry {
    routes: Mutex<HashMap<u32, ForwardRoute>>,
}

impl ForwardRegistry {
    pub(crate) fn insert(&self, remote_port: u32, route: ForwardRoute) {
        self.lock().insert(remote_port, route);
    }

    pub(crate) fn remove(&self, remote_port: u32) -> Option<ForwardRoute> {
        self.lock().remove(&remote_port)
    }

    fn target(&self, remote_port: u32) -> Option<String> {
        self.lock().get(&remote_port).map(|r| r.target.clone())
    }

    /// Drop every route, telling each forward why it ended.
    pub(crate) fn fail_all(&self, reason: &str) {
        let routes: Vec<_> = self.lock().drain().collect();
        for (_, mut route) in routes {
            if let Some(done) = route.done.take() {
                let _ = done.send(reason.to_string());
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, ForwardRoute>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handler attached to every connection a [`Client`](super::Client) makes.
pub(crate) struct ClientHandler {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) verification: HostKeyVerification,
    pub(crate) forwards: Arc<ForwardRegistry>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let host = self.host.as_str();
        let known = russh::keys::check_known_hosts(host, self.port, server_public_key);

        let accepted = match (self.verification, known) {
            #[cfg(feature = "insecure-skip-verify")]
            (HostKeyVerification::AcceptAll, _) => {
                tracing::warn!(host, "Accepting server key without verification (INSECURE)");
                true
            }
            (_, Ok(true)) => true,
            (_, Err(e)) => {
                tracing::error!(host, error = %e, "Host key does not match known_hosts");
                false
            }
            (HostKeyVerification::Tofu, Ok(false)) => {
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts(host, self.port, server_public_key) {
                    tracing::warn!(host, error = %e, "Could not record host key in known_hosts");
                } else {
                    tracing::info!(host, "Learned new host key");
                }
                true
            }
            (HostKeyVerification::KnownHosts | HostKeyVerification::RejectUnknown, Ok(false)) => {
                tracing::warn!(host, "Host not found in known_hosts, rejecting");
                false
            }
        };
        Ok(accepted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(target) = self.forwards.target(connected_port) else {
            tracing::warn!(
                host = %self.host,
                connected_address,
                connected_port,
                "Forwarded connection for unknown port, closing"
            );
            let _ = channel.close().await;
            return Ok(());
        };

        tracing::debug!(
            host = %self.host,
            origin = %format!("{originator_address}:{originator_port}"),
            target = %target,
            "Forwarded connection"
        );

        tokio::spawn(async move {
            let mut local = match tokio::net::TcpStream::connect(&target).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "Reverse tunnel target unreachable");
                    let _ = channel.close().await;
                    return;
                }
            };
            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                tracing::debug!(target = %target, error = %e, "Reverse tunnel connection ended");
            }
        });

        Ok(())
    }
}
