//! Convenient re-exports for common rust-node-ssh usage.
//!
//! ```ignore
//! use rust_node_ssh::prelude::*;
//! ```

// Connection
pub use crate::agent::{AgentPrivateKey, KeyRegistry};
pub use crate::session::{Host, Session, SessionInput};
pub use crate::transport::{Client, ClientBuilder, ConnectionEvent, Transport};

// Configuration
pub use crate::config::{ClientConfig, HealthMonitorConfig, LoggingConfig};

// Error handling
pub use crate::error::{ConnectionError, ExitError, NodeError, Result, TunnelError};

// Remote operations
pub use crate::check::Check;
pub use crate::command::Command;
pub use crate::file::File;
pub use crate::node::{NodeClient, NodeInterface};
pub use crate::script::Script;

// Tunnels
pub use crate::reverse_tunnel::{
    ReverseTunnel, ReverseTunnelChecker, ReverseTunnelKiller, ReverseTunnelState,
};
pub use crate::tunnel::{Tunnel, TunnelAddress};
