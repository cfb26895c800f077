//! SSH authentication.
//!
//! Methods are tried in a fixed order: private keys from the
//! [`KeyRegistry`](crate::agent::KeyRegistry), then the agent behind
//! `SSH_AUTH_SOCK`, then the password.

use std::sync::Arc;

use russh::client::Handle;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};

use super::handler::ClientHandler;
use crate::error::{ConnectionError, Result};

/// Environment variable pointing at the SSH agent socket.
pub const AGENT_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Host key verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Accept all host keys (INSECURE, testing only).
    #[cfg(feature = "insecure-skip-verify")]
    AcceptAll,
    /// Reject hosts that are not already in `known_hosts`.
    RejectUnknown,
    /// Verify against `known_hosts`, reject unknown hosts.
    KnownHosts,
    /// Trust on first use: learn unknown keys, reject changed ones.
    #[default]
    Tofu,
}

/// What a connection attempt may authenticate with.
#[derive(Clone, Default)]
pub(crate) struct Credentials {
    pub(crate) user: String,
    pub(crate) keys: Vec<Arc<PrivateKey>>,
    pub(crate) agent: bool,
    pub(crate) password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("keys", &self.keys.len())
            .field("agent", &self.agent)
            .field("password", &self.password.is_some())
            .finish()
    }
}

impl Credentials {
    pub(crate) fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub(crate) fn with_keys(mut self, keys: Vec<Arc<PrivateKey>>) -> Self {
        self.keys = keys;
        self
    }

    /// Use the agent if `SSH_AUTH_SOCK` is set and non-empty.
    pub(crate) fn with_agent_from_env(mut self) -> Self {
        self.agent = std::env::var_os(AGENT_SOCK_ENV).is_some_and(|v| !v.is_empty());
        self
    }

    pub(crate) fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty() && !self.agent && self.password.is_none()
    }
}

/// Authenticate `handle` or fail with the last reason seen.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    credentials: &Credentials,
    host: &str,
) -> Result<()> {
    let user = credentials.user.as_str();
    let mut last_reason = String::from("no authentication method succeeded");

    if !credentials.keys.is_empty() {
        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        for key in &credentials.keys {
            let key = PrivateKeyWithHashAlg::new(Arc::clone(key), rsa_hash);
            match handle.authenticate_publickey(user, key).await {
                Ok(result) if result.success() => {
                    tracing::debug!(user, host, "Public key authentication successful");
                    return Ok(());
                }
                Ok(_) => last_reason = "public key rejected".to_string(),
                Err(e) => last_reason = format!("public key authentication error: {e}"),
            }
        }
    }

    if credentials.agent {
        match authenticate_with_agent(handle, user).await {
            Ok(true) => {
                tracing::debug!(user, host, "Agent authentication successful");
                return Ok(());
            }
            Ok(false) => last_reason = "agent keys rejected".to_string(),
            Err(e) => {
                if credentials.keys.is_empty() && credentials.password.is_none() {
                    return Err(e);
                }
                last_reason = e.to_string();
            }
        }
    }

    if let Some(password) = &credentials.password {
        match handle.authenticate_password(user, password).await {
            Ok(result) if result.success() => {
                tracing::debug!(user, host, "Password authentication successful");
                return Ok(());
            }
            Ok(_) => last_reason = "password rejected".to_string(),
            Err(e) => last_reason = format!("password authentication error: {e}"),
        }
    }

    Err(ConnectionError::authentication(user, host, last_reason).into())
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| ConnectionError::AgentUnavailable {
            reason: e.to_string(),
        })?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectionError::AgentUnavailable {
            reason: e.to_string(),
        })?;

    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    for key in identities {
        match handle
            .authenticate_publickey_with(user, key, rsa_hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(e) => tracing::debug!(user, error = %e, "Agent key rejected"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut Handle<ClientHandler>, _user: &str) -> Result<bool> {
    Err(ConnectionError::AgentUnavailable {
        reason: "agent sockets are only supported on unix".to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_credentials() {
        assert!(Credentials::new("root").is_empty());
        assert!(Credentials::new("root").with_password(Some(String::new())).is_empty());
        assert!(!Credentials::new("root")
            .with_password(Some("secret".into()))
            .is_empty());
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials::new("root").with_password(Some("secret".into()));
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("password: true"));
    }

    #[test]
    fn default_policy_is_tofu() {
        assert_eq!(HostKeyVerification::default(), HostKeyVerification::Tofu);
    }
}
