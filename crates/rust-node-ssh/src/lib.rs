//! rust-node-ssh: remote node execution and tunnels over SSH
//!
//! This crate lets an installer or orchestrator drive cluster nodes over an
//! authenticated SSH connection: run commands (with interactive sudo), upload
//! and run scripts and step bundles, transfer files, and keep local and
//! reverse tunnels alive.
//!
//! # Features
//!
//! - **Direct or bastion connections** with bounded retries and keep-alive
//! - **Sudo handshake** driven by a byte-level prompt matcher
//! - **Timeouts and cancellation** sharing one SIGINT-then-SIGKILL stop path
//! - **Reverse tunnels** with a health monitor and typed give-up error
//! - **Fake transport** for tests (feature: `test-utils`)
//!
//! # Example
//!
//! ```ignore
//! use rust_node_ssh::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::new(SessionInput {
//!         user: "ubuntu".into(),
//!         available_hosts: vec![Host::new("10.0.0.10", "master-0")],
//!         become_pass: Some("secret".into()),
//!         ..SessionInput::default()
//!     });
//!     let client = Client::builder(session)
//!         .private_keys(vec![AgentPrivateKey::new("/home/me/.ssh/id_ed25519")])
//!         .build();
//!     client.start().await?;
//!
//!     let mut cmd = client.command("systemctl", &["is-active", "kubelet"]).sudo();
//!     let (stdout, _) = cmd.output().await?;
//!     println!("{}", String::from_utf8_lossy(&stdout));
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod check;
pub mod command;
pub mod config;
pub mod error;
pub mod file;
pub mod health;
pub mod logging;
pub mod matcher;
pub mod node;
pub mod prelude;
pub mod reverse_tunnel;
pub mod script;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use agent::{AgentPrivateKey, KeyRegistry};
pub use check::Check;
pub use command::{Command, StopHandle};
pub use config::{BundleConfig, ClientConfig, HealthMonitorConfig, LoggingConfig};
pub use error::{ConnectionError, ExitError, NodeError, Result, TunnelError};
pub use file::File;
pub use health::{HealthStatus, serve_healthz};
pub use matcher::{BecomeHandshake, BecomeState, ByteSequenceMatcher};
pub use node::{NodeClient, NodeInterface};
pub use reverse_tunnel::{
    HealthMonitor, ReverseTunnel, ReverseTunnelChecker, ReverseTunnelKiller, ReverseTunnelState,
    RunScriptReverseTunnelChecker, RunScriptReverseTunnelKiller,
};
pub use script::{BundleTracker, Script, StepEvent};
pub use session::{Host, Session, SessionInput};
pub use transport::{Client, ClientBuilder, ConnectionEvent, HostKeyVerification, Transport};
pub use tunnel::{Tunnel, TunnelAddress};

// Test utilities
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(any(test, feature = "test-utils"))]
pub use test_utils::{FakeForwarder, FakeTransport, MemoryFs};
