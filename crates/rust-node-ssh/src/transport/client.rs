//! The SSH client: one authenticated connection and everything hanging off it.
//!
//! A [`Client`] dials its session's current host, directly or through the
//! bastion, and then serves [`Transport`] requests on that connection. It
//! tracks the remote shells and proxies created from it so [`Client::stop`]
//! can release them before the connection goes away.
//!
//! # Connection loss
//!
//! A background keep-alive task probes the connection. When probing fails
//! the client is marked not-live, its shells and forwards are torn down and
//! [`ConnectionEvent::Lost`] is broadcast. New operations then fail with
//! [`ConnectionError::Lost`] until the owner calls [`Client::reconnect`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::BoxFuture;
use russh::client::{self, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::sync::{RwLock, broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use super::auth::{self, Credentials};
use super::handler::{ClientHandler, ForwardRegistry, ForwardRoute};
use super::keepalive::{self, KeepaliveTarget};
use super::process::{self, ShellRegistry};
use super::sftp::SftpFs;
use super::{BoxedStream, ForwardHandle, ProcessHandle, RemoteFs, Transport};
use crate::agent::{AgentPrivateKey, KeyRegistry};
use crate::config::ClientConfig;
use crate::error::{ConnectionError, NodeError, Result};
use crate::session::{Bastion, Session};
use crate::tunnel::TunnelAddress;

/// Changes in connection state, see [`Client::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Keep-alive gave up on the connection.
    Lost {
        /// What the last probe saw.
        reason: String,
    },
    /// [`Client::reconnect`] succeeded.
    Restored,
}

struct Connection {
    handle: Handle<ClientHandler>,
    bastion: Option<Handle<ClientHandler>>,
}

struct ClientInner {
    session: Session,
    keys: Arc<KeyRegistry>,
    private_keys: Vec<AgentPrivateKey>,
    config: ClientConfig,
    connection: RwLock<Option<Connection>>,
    live: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    lost_reason: Mutex<Option<String>>,
    shells: Arc<ShellRegistry>,
    forwards: Arc<ForwardRegistry>,
    proxies: Mutex<Vec<CancellationToken>>,
    keepalive: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    session: Session,
    private_keys: Vec<AgentPrivateKey>,
    keys: Option<Arc<KeyRegistry>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start building a client for `session`.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            private_keys: Vec::new(),
            keys: None,
            config: ClientConfig::default(),
        }
    }

    /// Private keys to authenticate with.
    #[must_use]
    pub fn private_keys(mut self, keys: Vec<AgentPrivateKey>) -> Self {
        self.private_keys = keys;
        self
    }

    /// Share a key registry between clients. Defaults to a fresh one.
    #[must_use]
    pub fn key_registry(mut self, registry: Arc<KeyRegistry>) -> Self {
        self.keys = Some(registry);
        self
    }

    /// Client configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the client. Nothing is dialed until [`Client::start`].
    #[must_use]
    pub fn build(self) -> Client {
        let (events, _) = broadcast::channel(16);
        Client {
            inner: Arc::new(ClientInner {
                session: self.session,
                keys: self.keys.unwrap_or_else(KeyRegistry::new),
                private_keys: self.private_keys,
                config: self.config,
                connection: RwLock::new(None),
                live: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                lost_reason: Mutex::new(None),
                shells: Arc::new(ShellRegistry::default()),
                forwards: Arc::new(ForwardRegistry::default()),
                proxies: Mutex::new(Vec::new()),
                keepalive: Mutex::new(None),
                events,
            }),
        }
    }
}

/// SSH client bound to a [`Session`].
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.inner.session.to_string())
            .field("live", &self.is_live())
            .field("shells", &self.inner.shells.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Shortcut for [`ClientBuilder::new`].
    #[must_use]
    pub fn builder(session: Session) -> ClientBuilder {
        ClientBuilder::new(session)
    }

    /// Session this client connects with.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Private key sources this client was built with.
    #[must_use]
    pub fn private_keys(&self) -> &[AgentPrivateKey] {
        &self.inner.private_keys
    }

    /// Whether the connection is currently usable.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Receive connection state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Load the private keys without connecting.
    pub async fn prepare_keys(&self) -> Result<()> {
        self.inner.keys.init(&self.inner.private_keys).await
    }

    /// Reload the private keys from disk.
    pub async fn refresh_keys(&self) -> Result<()> {
        if self.inner.keys.is_initialized() {
            self.inner.keys.refresh().await
        } else {
            self.prepare_keys().await
        }
    }

    /// Load keys, connect and start keep-alive.
    pub async fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ConnectionError::Stopped.into());
        }
        self.prepare_keys().await?;
        self.inner.connect().await?;
        self.inner.started.store(true, Ordering::SeqCst);
        ClientInner::spawn_keepalive(&self.inner);
        Ok(())
    }

    /// Drop the current connection and dial again.
    ///
    /// Clears a [`ConnectionError::Lost`] condition.
    pub async fn reconnect(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ConnectionError::Stopped.into());
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotStarted.into());
        }
        tracing::info!(session = %self.inner.session, "Reconnecting");

        self.inner.cancel_keepalive();
        self.inner.live.store(false, Ordering::SeqCst);
        self.inner.shells.shutdown(self.inner.config.stop_grace).await;
        self.inner.forwards.fail_all("connection restarted");
        self.inner.disconnect().await;

        self.inner.connect().await?;
        *self.inner.lost() = None;
        ClientInner::spawn_keepalive(&self.inner);
        let _ = self.inner.events.send(ConnectionEvent::Restored);
        Ok(())
    }

    /// Release proxies and shells, then close the connection.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = %self.inner.session, "Stopping client");

        self.inner.cancel_keepalive();
        let proxies = std::mem::take(&mut *self.inner.proxies());
        for proxy in proxies {
            proxy.cancel();
        }
        self.inner.forwards.fail_all("client stopped");
        self.inner.shells.shutdown(self.inner.config.stop_grace).await;

        self.inner.live.store(false, Ordering::SeqCst);
        self.inner.disconnect().await;
    }

    /// Run `f` once per available host, each time on a fresh client bound
    /// to that host. Stops at the first error.
    pub async fn loop_hosts<F>(&self, mut f: F) -> Result<()>
    where
        F: for<'c> FnMut(&'c Client) -> BoxFuture<'c, Result<()>>,
    {
        let session = self.inner.session.copy();
        for host in session.available_hosts() {
            tracing::debug!(host = %host, "Running on host");
            let client = ClientBuilder::new(session.for_host(host))
                .private_keys(self.inner.private_keys.clone())
                .key_registry(Arc::clone(&self.inner.keys))
                .config(self.inner.config.clone())
                .build();
            client.start().await?;
            let result = f(&client).await;
            client.stop().await;
            result?;
        }
        Ok(())
    }

    async fn open_session(&self) -> Result<Channel<Msg>> {
        self.inner.ensure_live()?;
        let inner: &ClientInner = &self.inner;
        let host = inner.session.host();
        let host = host.as_str();
        inner
            .config
            .session_retry
            .run("Establish new session", move |_| inner.channel_open_session(host))
            .await
    }
}

impl ClientInner {
    fn proxies(&self) -> std::sync::MutexGuard<'_, Vec<CancellationToken>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lost(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.lost_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ConnectionError::Stopped.into());
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotStarted.into());
        }
        if let Some(reason) = self.lost().clone() {
            return Err(ConnectionError::Lost { reason }.into());
        }
        Ok(())
    }

    fn handler(&self, host: &str, port: u16) -> ClientHandler {
        ClientHandler {
            host: host.to_string(),
            port,
            verification: self.config.host_key_verification,
            forwards: Arc::clone(&self.forwards),
        }
    }

    fn target_credentials(&self) -> Credentials {
        Credentials::new(self.session.user())
            .with_keys(self.keys.keys())
            .with_agent_from_env()
            .with_password(self.session.become_pass().map(str::to_string))
    }

    fn bastion_credentials(&self, bastion: &Bastion) -> Credentials {
        Credentials::new(&bastion.user)
            .with_keys(self.keys.keys())
            .with_agent_from_env()
            .with_password(bastion.password.clone())
    }

    async fn connect(&self) -> Result<()> {
        let host = self.session.host();
        if host.is_empty() {
            return Err(ConnectionError::NoHosts.into());
        }
        let host = host.as_str();
        let port = self.session.port();
        let credentials = self.target_credentials();
        if credentials.is_empty() {
            return Err(ConnectionError::NoCredentials.into());
        }
        let credentials = &credentials;

        let connection = match self.session.bastion() {
            None => {
                tracing::info!(host = %host, port, user = %self.session.user(), "Connecting to host");
                let handle = self
                    .config
                    .dial_retry
                    .run("Connect to host", move |_| self.dial_direct(host, port, credentials))
                    .await?;
                Connection {
                    handle,
                    bastion: None,
                }
            }
            Some(bastion) => {
                let bastion_credentials = self.bastion_credentials(bastion);
                if bastion_credentials.is_empty() {
                    return Err(ConnectionError::NoBastionCredentials.into());
                }
                let bastion_credentials = &bastion_credentials;
                tracing::info!(
                    bastion = %bastion.host,
                    bastion_port = bastion.port,
                    "Connecting to bastion host"
                );
                let bastion_handle = self
                    .config
                    .dial_retry
                    .run("Connect to bastion host", move |_| {
                        self.dial_bastion(bastion, bastion_credentials)
                    })
                    .await?;

                tracing::info!(host = %host, port, bastion = %bastion.host, "Connecting to host through bastion");
                let bastion_ref = &bastion_handle;
                let handle = self
                    .config
                    .dial_retry
                    .run("Connect to host through bastion", move |_| {
                        self.dial_through(bastion_ref, bastion, host, port, credentials)
                    })
                    .await?;
                Connection {
                    handle,
                    bastion: Some(bastion_handle),
                }
            }
        };

        *self.connection.write().await = Some(connection);
        self.live.store(true, Ordering::SeqCst);
        tracing::info!(session = %self.session, "SSH connection established");
        Ok(())
    }

    async fn dial_direct(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Handle<ClientHandler>> {
        let ssh_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, (host, port), self.handler(host, port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            host: host.to_string(),
            duration: self.config.connect_timeout,
        })?
        .map_err(|e| ConnectionError::dial(host, port, e))?;

        auth::authenticate(&mut handle, credentials, host).await?;
        Ok(handle)
    }

    async fn dial_bastion(
        &self,
        bastion: &Bastion,
        credentials: &Credentials,
    ) -> Result<Handle<ClientHandler>> {
        self.dial_direct(&bastion.host, bastion.port, credentials)
            .await
            .map_err(|e| match e {
                NodeError::Connection(ConnectionError::Dial { host, port, reason }) => {
                    ConnectionError::Bastion { host, port, reason }.into()
                }
                other => other,
            })
    }

    async fn dial_through(
        &self,
        bastion_handle: &Handle<ClientHandler>,
        bastion: &Bastion,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Handle<ClientHandler>> {
        let through = |reason: String| ConnectionError::ThroughBastion {
            host: host.to_string(),
            bastion: bastion.host.clone(),
            reason,
        };

        let channel = bastion_handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| through(format!("failed to open tunnel: {e}")))?;

        let ssh_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect_stream(ssh_config, channel.into_stream(), self.handler(host, port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            host: host.to_string(),
            duration: self.config.connect_timeout,
        })?
        .map_err(|e| through(e.to_string()))?;

        auth::authenticate(&mut handle, credentials, host).await?;
        Ok(handle)
    }

    async fn disconnect(&self) {
        let Some(connection) = self.connection.write().await.take() else {
            return;
        };
        if let Err(e) = connection
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(error = %e, "Disconnect failed");
        }
        if let Some(bastion) = connection.bastion {
            let _ = bastion.disconnect(Disconnect::ByApplication, "", "en").await;
        }
    }

    async fn channel_open_session(&self, host: &str) -> Result<Channel<Msg>> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(ConnectionError::NotStarted)?;
        connection
            .handle
            .channel_open_session()
            .await
            .map_err(|e| NodeError::channel(host, e))
    }

    fn cancel_keepalive(&self) {
        let token = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn mark_lost(&self, reason: String) {
        tracing::warn!(session = %self.session, reason = %reason, "Connection lost");
        self.live.store(false, Ordering::SeqCst);
        *self.lost() = Some(reason.clone());
        // The connection is gone, so there is nothing to wait for.
        drop(self.shells.close_all());
        self.forwards.fail_all(&reason);
        let _ = self.events.send(ConnectionEvent::Lost { reason });
    }

    /// Exactly one keep-alive task runs per client; a new one replaces the old.
    fn spawn_keepalive(this: &Arc<Self>) {
        if !this.config.keepalive.enabled {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = this
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        let weak: Weak<Self> = Arc::downgrade(this);
        let config = this.config.keepalive.clone();
        tokio::spawn(async move {
            let probe_target = weak.clone();
            let lost = keepalive::watch(config, token, move || {
                let target = probe_target.clone();
                async move {
                    match target.upgrade() {
                        Some(inner) => keepalive::probe(inner.as_ref()).await,
                        None => Err(ConnectionError::Stopped.into()),
                    }
                }
            })
            .await;

            if let (Some(reason), Some(inner)) = (lost, weak.upgrade()) {
                if !inner.stopped.load(Ordering::SeqCst) {
                    inner.mark_lost(reason);
                }
            }
        });
    }
}

impl KeepaliveTarget for ClientInner {
    fn open_throwaway(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let host = self.session.host();
            let channel = self.channel_open_session(&host).await?;
            channel.close().await.map_err(|e| NodeError::channel(&host, e))
        })
    }

    fn request_keepalive(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let guard = self.connection.read().await;
            let connection = guard.as_ref().ok_or(ConnectionError::NotStarted)?;
            connection
                .handle
                .send_keepalive(true)
                .await
                .map_err(|e| NodeError::channel(self.session.host(), e))
        })
    }
}

impl Transport for Client {
    fn host(&self) -> String {
        self.inner.session.host()
    }

    fn become_pass(&self) -> Option<String> {
        self.inner.session.become_pass().map(str::to_string)
    }

    fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn exec(&self, command_line: String) -> BoxFuture<'_, Result<ProcessHandle>> {
        Box::pin(async move {
            let host = self.host();
            let channel = self.open_session().await?;
            channel
                .exec(true, command_line)
                .await
                .map_err(|e| NodeError::channel(&host, e))?;
            Ok(process::spawn(channel, Arc::clone(&self.inner.shells), host))
        })
    }

    fn dial(&self, host: String, port: u16) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            self.inner.ensure_live()?;
            let guard = self.inner.connection.read().await;
            let connection = guard.as_ref().ok_or(ConnectionError::NotStarted)?;
            let channel = connection
                .handle
                .channel_open_direct_tcpip(host.as_str(), u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| NodeError::channel(self.host(), e))?;
            Ok(Box::new(channel.into_stream()) as BoxedStream)
        })
    }

    fn remote_forward(&self, address: TunnelAddress) -> BoxFuture<'_, Result<ForwardHandle>> {
        Box::pin(async move {
            self.inner.ensure_live()?;
            let remote_host = address.remote_host.clone();
            let remote_port = u32::from(address.remote_port);
            {
                let mut guard = self.inner.connection.write().await;
                let connection = guard.as_mut().ok_or(ConnectionError::NotStarted)?;
                connection
                    .handle
                    .tcpip_forward(remote_host.as_str(), remote_port)
                    .await
                    .map_err(|e| NodeError::channel(self.host(), e))?;
            }

            let (done_tx, done_rx) = oneshot::channel();
            self.inner.forwards.insert(
                remote_port,
                ForwardRoute {
                    target: address.local(),
                    done: Some(done_tx),
                },
            );
            tracing::info!(address = %address, "Remote forward established");

            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let inner = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                token.cancelled().await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if inner.forwards.remove(remote_port).is_none() {
                    return;
                }
                let guard = inner.connection.read().await;
                if let Some(connection) = guard.as_ref() {
                    if let Err(e) = connection
                        .handle
                        .cancel_tcpip_forward(remote_host.as_str(), remote_port)
                        .await
                    {
                        tracing::debug!(port = remote_port, error = %e, "Cancel remote forward failed");
                    }
                }
            });

            Ok(ForwardHandle {
                done: done_rx,
                cancel,
            })
        })
    }

    fn open_fs(&self) -> BoxFuture<'_, Result<Box<dyn RemoteFs>>> {
        Box::pin(async move {
            let host = self.host();
            let channel = self.open_session().await?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| NodeError::channel(&host, e))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| NodeError::channel(&host, format!("sftp: {e}")))?;
            Ok(Box::new(SftpFs::new(host, sftp)) as Box<dyn RemoteFs>)
        })
    }

    fn register_proxy(&self, token: CancellationToken) {
        let mut proxies = self.inner.proxies();
        proxies.retain(|t| !t.is_cancelled());
        proxies.push(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Host, SessionInput};

    fn session(hosts: &[&str]) -> Session {
        Session::new(SessionInput {
            user: "ubuntu".into(),
            available_hosts: hosts.iter().map(|h| Host::new(*h, *h)).collect(),
            ..SessionInput::default()
        })
    }

    #[tokio::test]
    async fn operations_before_start_fail() {
        let client = Client::builder(session(&["10.0.0.1"])).build();
        let err = client.exec("true".into()).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Connection(ConnectionError::NotStarted)
        ));
        assert!(!client.is_live());
    }

    #[tokio::test]
    async fn start_without_credentials_fails() {
        if std::env::var_os(auth::AGENT_SOCK_ENV).is_some() {
            return;
        }
        let client = Client::builder(session(&["10.0.0.1"])).build();
        let err = client.start().await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Connection(ConnectionError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn start_without_hosts_fails() {
        let client = Client::builder(session(&[])).build();
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Connection(ConnectionError::NoHosts)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let client = Client::builder(session(&["10.0.0.1"])).build();
        client.stop().await;
        client.stop().await;
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Connection(ConnectionError::Stopped)));
        let err = client.exec("true".into()).await.unwrap_err();
        assert!(matches!(err, NodeError::Connection(ConnectionError::Stopped)));
    }

    #[tokio::test]
    async fn stop_cancels_registered_proxies() {
        let client = Client::builder(session(&["10.0.0.1"])).build();
        let token = CancellationToken::new();
        client.register_proxy(token.clone());
        client.stop().await;
        assert!(token.is_cancelled());
    }

    #[test]
    fn lost_connection_refuses_work() {
        let client = Client::builder(session(&["10.0.0.1"])).build();
        client.inner.started.store(true, Ordering::SeqCst);
        let mut events = client.subscribe();
        client.inner.mark_lost("no keep-alive reply".into());
        assert!(!client.is_live());
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectionEvent::Lost {
                reason: "no keep-alive reply".into()
            }
        );
        let err = client.inner.ensure_live().unwrap_err();
        assert!(matches!(
            err,
            NodeError::Connection(ConnectionError::Lost { .. })
        ));
    }
}
