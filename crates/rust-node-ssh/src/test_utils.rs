//! Test utilities for rust-node-ssh.
//!
//! [`FakeTransport`] stands in for a connected [`Client`](crate::transport::Client):
//! remote processes are scripted per command line, files live in a
//! [`MemoryFs`], remote forwards are handed out by a [`FakeForwarder`] and
//! `dial` connects to real local sockets.

mod fake_transport;
mod memory_fs;
pub mod scripts;

pub use fake_transport::{FakeForwarder, FakeProcessIo, FakeScript, FakeTransport};
pub use memory_fs::MemoryFs;
