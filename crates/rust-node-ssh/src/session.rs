//! Connection parameters and the rotating pool of candidate hosts.
//!
//! A [`Session`] is cheap to clone and safe to share: host rotation state
//! sits behind a lock so a [`Client`](crate::transport::Client) and the code
//! that owns it can both observe the current host.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// A candidate target host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    /// Node name, used for ordering and display.
    pub name: String,
    /// Address to connect to.
    pub host: String,
}

impl Host {
    /// Create a host entry.
    #[must_use]
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() || self.name == self.host {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{} ({})", self.name, self.host)
        }
    }
}

/// Bastion (jump host) parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bastion {
    /// Bastion address.
    pub host: String,
    /// Bastion port.
    pub port: u16,
    /// Bastion user.
    pub user: String,
    /// Bastion password, if password auth is used.
    pub password: Option<String>,
}

/// Everything needed to build a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionInput {
    /// SSH user on the target hosts.
    pub user: String,
    /// SSH port on the target hosts (`None` means 22).
    pub port: Option<u16>,
    /// Bastion address, empty when connecting directly.
    pub bastion_host: String,
    /// Bastion port (`None` means 22).
    pub bastion_port: Option<u16>,
    /// Bastion user (empty means same as `user`).
    pub bastion_user: String,
    /// Bastion password.
    pub bastion_password: Option<String>,
    /// Extra ssh arguments passed through untouched.
    pub extra_args: String,
    /// Password for sudo and, as a fallback, for SSH password auth.
    pub become_pass: Option<String>,
    /// Candidate target hosts.
    pub available_hosts: Vec<Host>,
}

#[derive(Debug, Default)]
struct Rotation {
    available: Vec<Host>,
    remaining: Vec<Host>,
    current: Option<Host>,
}

impl Rotation {
    fn new(mut hosts: Vec<Host>) -> Self {
        hosts.sort();
        hosts.dedup();
        Self {
            available: hosts,
            remaining: Vec::new(),
            current: None,
        }
    }

    fn choose_next(&mut self) {
        if self.available.is_empty() {
            self.current = None;
            self.remaining.clear();
            return;
        }

        let next = self
            .current
            .as_ref()
            .and_then(|cur| self.available.iter().position(|h| h == cur))
            .map_or(0, |idx| idx + 1);

        if next >= self.available.len() || next == 0 {
            let first = self.available[0].clone();
            self.remaining = self.available[1..].to_vec();
            self.current = Some(first);
        } else {
            let chosen = self.available[next].clone();
            self.remaining.retain(|h| h != &chosen);
            self.current = Some(chosen);
        }
    }
}

#[derive(Debug)]
struct Inner {
    user: String,
    port: u16,
    bastion: Option<Bastion>,
    extra_args: String,
    become_pass: Option<String>,
    rotation: Mutex<Rotation>,
}

/// Connection parameters plus host rotation.
///
/// Cloning shares rotation state; use [`Session::copy`] for an independent
/// session with rotation reset.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Build a session and select the first available host.
    #[must_use]
    pub fn new(input: SessionInput) -> Self {
        let bastion = if input.bastion_host.is_empty() {
            None
        } else {
            Some(Bastion {
                host: input.bastion_host,
                port: input.bastion_port.unwrap_or(DEFAULT_PORT),
                user: if input.bastion_user.is_empty() {
                    input.user.clone()
                } else {
                    input.bastion_user
                },
                password: input.bastion_password,
            })
        };

        let mut rotation = Rotation::new(input.available_hosts);
        rotation.choose_next();

        Self {
            inner: Arc::new(Inner {
                user: input.user,
                port: input.port.unwrap_or(DEFAULT_PORT),
                bastion,
                extra_args: input.extra_args,
                become_pass: input.become_pass,
                rotation: Mutex::new(rotation),
            }),
        }
    }

    fn rotation(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.inner
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// SSH user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// SSH port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Bastion parameters, if configured.
    #[must_use]
    pub fn bastion(&self) -> Option<&Bastion> {
        self.inner.bastion.as_ref()
    }

    /// Extra ssh arguments.
    #[must_use]
    pub fn extra_args(&self) -> &str {
        &self.inner.extra_args
    }

    /// Password used for sudo.
    #[must_use]
    pub fn become_pass(&self) -> Option<&str> {
        self.inner.become_pass.as_deref()
    }

    /// Address of the current host, empty when there is none.
    #[must_use]
    pub fn host(&self) -> String {
        self.rotation()
            .current
            .as_ref()
            .map(|h| h.host.clone())
            .unwrap_or_default()
    }

    /// The current host.
    #[must_use]
    pub fn current_host(&self) -> Option<Host> {
        self.rotation().current.clone()
    }

    /// `host:port` of the current host.
    #[must_use]
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.host(), self.inner.port)
    }

    /// Move to the next host in order, wrapping to the first after the last.
    pub fn choice_new_host(&self) {
        let mut rotation = self.rotation();
        rotation.choose_next();
        if let Some(host) = &rotation.current {
            tracing::debug!(host = %host, remaining = rotation.remaining.len(), "Selected host");
        }
    }

    /// Hosts not yet visited in the current rotation.
    #[must_use]
    pub fn remaining_hosts(&self) -> Vec<Host> {
        self.rotation().remaining.clone()
    }

    /// Candidate hosts, sorted by name then address.
    #[must_use]
    pub fn available_hosts(&self) -> Vec<Host> {
        self.rotation().available.clone()
    }

    /// Replace the candidate hosts and restart rotation.
    pub fn set_available_hosts(&self, hosts: Vec<Host>) {
        let mut rotation = self.rotation();
        *rotation = Rotation::new(hosts);
        rotation.choose_next();
    }

    /// Add candidate hosts and restart rotation.
    pub fn add_available_hosts(&self, hosts: impl IntoIterator<Item = Host>) {
        let mut all = self.available_hosts();
        all.extend(hosts);
        self.set_available_hosts(all);
    }

    /// Remove candidate hosts and restart rotation.
    pub fn remove_available_hosts(&self, hosts: &[Host]) {
        let mut all = self.available_hosts();
        all.retain(|h| !hosts.contains(h));
        self.set_available_hosts(all);
    }

    /// Independent copy with the same parameters and rotation reset.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self::new(SessionInput {
            user: self.inner.user.clone(),
            port: Some(self.inner.port),
            bastion_host: self
                .inner
                .bastion
                .as_ref()
                .map(|b| b.host.clone())
                .unwrap_or_default(),
            bastion_port: self.inner.bastion.as_ref().map(|b| b.port),
            bastion_user: self
                .inner
                .bastion
                .as_ref()
                .map(|b| b.user.clone())
                .unwrap_or_default(),
            bastion_password: self.inner.bastion.as_ref().and_then(|b| b.password.clone()),
            extra_args: self.inner.extra_args.clone(),
            become_pass: self.inner.become_pass.clone(),
            available_hosts: self.available_hosts(),
        })
    }

    /// Copy bound to a single host.
    #[must_use]
    pub fn for_host(&self, host: Host) -> Self {
        let copy = self.copy();
        copy.set_available_hosts(vec![host]);
        copy
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.inner.user, self.host(), self.inner.port)?;
        if let Some(b) = &self.inner.bastion {
            write!(f, " (via {}@{}:{})", b.user, b.host, b.port)?;
        }
        Ok(())
    }
}
