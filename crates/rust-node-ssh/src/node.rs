//! Node capabilities as seen by orchestration code.
//!
//! Callers depend on [`NodeInterface`] (run things on one node) or
//! [`NodeClient`] (also manage the connection), not on [`Client`] itself.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::check::Check;
use crate::command::Command;
use crate::error::Result;
use crate::file::File;
use crate::reverse_tunnel::ReverseTunnel;
use crate::script::Script;
use crate::transport::{Client, Transport};
use crate::tunnel::Tunnel;

/// Callback run by [`NodeClient::loop_hosts`] once per host.
pub type HostFn<'a> =
    Box<dyn for<'c> FnMut(&'c dyn NodeClient) -> BoxFuture<'c, Result<()>> + Send + 'a>;

/// Run things on one node.
pub trait NodeInterface: Send + Sync {
    /// A command `name args...`.
    fn command(&self, name: &str, args: &[&str]) -> Command;

    /// File transfers.
    fn file(&self) -> File;

    /// A local script to upload and run with `args`.
    fn upload_script(&self, path: &Path, args: &[&str]) -> Script;
}

/// A node together with its connection.
pub trait NodeClient: NodeInterface {
    /// Connect.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// A local forward for `remoteHost:remotePort:localHost:localPort`.
    fn tunnel(&self, address: &str) -> Result<Tunnel>;

    /// A remote forward for `remoteHost:remotePort:localHost:localPort`.
    fn reverse_tunnel(&self, address: &str) -> Result<ReverseTunnel>;

    /// Availability probe.
    fn check(&self) -> Check;

    /// Release everything and disconnect.
    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Run `f` against every available host in turn.
    fn loop_hosts<'a>(&'a self, f: HostFn<'a>) -> BoxFuture<'a, Result<()>>;
}

impl Client {
    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

impl NodeInterface for Client {
    fn command(&self, name: &str, args: &[&str]) -> Command {
        Command::new(self.transport(), name, args.iter().copied())
    }

    fn file(&self) -> File {
        File::new(self.transport())
    }

    fn upload_script(&self, path: &Path, args: &[&str]) -> Script {
        Script::new(self.transport(), path, args.iter().copied())
    }
}

impl NodeClient for Client {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Self::start(self))
    }

    fn tunnel(&self, address: &str) -> Result<Tunnel> {
        Tunnel::parse(self.transport(), address)
    }

    fn reverse_tunnel(&self, address: &str) -> Result<ReverseTunnel> {
        ReverseTunnel::parse(self.transport(), address)
    }

    fn check(&self) -> Check {
        Check::new(self.transport())
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(Self::stop(self))
    }

    fn loop_hosts<'a>(&'a self, mut f: HostFn<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Self::loop_hosts(self, move |client| f(client)).await
        })
    }
}
