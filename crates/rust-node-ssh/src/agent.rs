//! Process-scoped registry of private keys used for SSH authentication.
//!
//! The registry is created by the application, initialised once with the
//! configured keys and handed to every [`Client`](crate::transport::Client)
//! that needs it. Lifecycle:
//!
//! 1. [`KeyRegistry::new`] creates an empty registry.
//! 2. [`KeyRegistry::init`] loads and decrypts the keys. Later calls are
//!    no-ops until [`KeyRegistry::teardown`].
//! 3. [`KeyRegistry::refresh`] reloads the keys from disk, e.g. after the
//!    operator rotated them.
//! 4. [`KeyRegistry::teardown`] drops the decrypted material.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use russh::keys::PrivateKey;

use crate::error::{ConnectionError, NodeError, Result};

/// A private key file and its optional passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentPrivateKey {
    /// Path to the key file.
    pub key: PathBuf,
    /// Passphrase for encrypted keys.
    pub passphrase: Option<String>,
}

impl AgentPrivateKey {
    /// Unencrypted key at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            key: path.into(),
            passphrase: None,
        }
    }

    /// Set the passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

impl std::fmt::Debug for AgentPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPrivateKey")
            .field("key", &self.key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Default)]
struct State {
    sources: Vec<AgentPrivateKey>,
    loaded: Vec<Arc<PrivateKey>>,
    initialized: bool,
}

/// Decrypted private keys shared by all clients of a process.
#[derive(Default)]
pub struct KeyRegistry {
    state: RwLock<State>,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeyRegistry")
            .field("sources", &state.sources)
            .field("loaded", &state.loaded.len())
            .field("initialized", &state.initialized)
            .finish()
    }
}

impl KeyRegistry {
    /// Create an empty, uninitialised registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Load `keys` unless the registry is already initialised.
    pub async fn init(&self, keys: &[AgentPrivateKey]) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let loaded = load_all(keys).await?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.initialized {
            state.sources = keys.to_vec();
            state.loaded = loaded;
            state.initialized = true;
            tracing::debug!(keys = state.loaded.len(), "Private keys initialised");
        }
        Ok(())
    }

    /// Reload the keys given to [`init`](Self::init) from disk.
    pub async fn refresh(&self) -> Result<()> {
        let sources = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.sources.clone()
        };
        let loaded = load_all(&sources).await?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.loaded = loaded;
        state.initialized = true;
        Ok(())
    }

    /// Drop all decrypted keys and allow a fresh [`init`](Self::init).
    pub fn teardown(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = State::default();
    }

    /// Whether [`init`](Self::init) has run since creation or teardown.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .initialized
    }

    /// Loaded keys, in the configured order.
    #[must_use]
    pub fn keys(&self) -> Vec<Arc<PrivateKey>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loaded
            .clone()
    }

    /// Key sources given to [`init`](Self::init).
    #[must_use]
    pub fn sources(&self) -> Vec<AgentPrivateKey> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sources
            .clone()
    }
}

async fn load_all(keys: &[AgentPrivateKey]) -> Result<Vec<Arc<PrivateKey>>> {
    let mut loaded = Vec::with_capacity(keys.len());
    for key in keys {
        loaded.push(load_private_key(&key.key, key.passphrase.as_deref()).await?);
    }
    Ok(loaded)
}

/// Load and decrypt one private key file.
pub async fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<Arc<PrivateKey>> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        NodeError::io_context(format!("failed to read private key {}", path.display()), e)
    })?;

    let key = russh::keys::decode_secret_key(&data, passphrase).map_err(|e| {
        let reason = if passphrase.is_none() && e.to_string().contains("encrypted") {
            format!("key {} is encrypted and no passphrase was given", path.display())
        } else {
            format!("failed to decode key {}: {e}", path.display())
        };
        NodeError::from(ConnectionError::authentication("", "", reason))
    })?;

    Ok(Arc::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_with_no_keys() {
        let registry = KeyRegistry::new();
        assert!(!registry.is_initialized());
        registry.init(&[]).await.unwrap();
        assert!(registry.is_initialized());
        assert!(registry.keys().is_empty());
    }

    #[tokio::test]
    async fn missing_key_file_fails_init() {
        let registry = KeyRegistry::new();
        let err = registry
            .init(&[AgentPrivateKey::new("/nonexistent/id_ed25519")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read private key"));
        assert!(!registry.is_initialized());
    }

    #[tokio::test]
    async fn teardown_allows_reinit() {
        let registry = KeyRegistry::new();
        registry.init(&[]).await.unwrap();
        registry.teardown();
        assert!(!registry.is_initialized());
        assert!(registry.sources().is_empty());
    }

    #[test]
    fn passphrase_is_redacted() {
        let key = AgentPrivateKey::new("/k").with_passphrase("hunter2");
        let dbg = format!("{key:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("redacted"));
    }
}
