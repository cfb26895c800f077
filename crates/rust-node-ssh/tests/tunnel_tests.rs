//! Local tunnel tests. The fake transport dials for real, so these run
//! against a loopback echo server.
//!
//! Needs the `test-utils` feature, which the dev-dependency on this crate enables.

#![cfg(feature = "test-utils")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_node_ssh::{FakeTransport, NodeError, Tunnel, TunnelAddress, TunnelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn tunnel(transport: &Arc<FakeTransport>, remote_port: u16) -> Tunnel {
    Tunnel::new(
        transport.clone(),
        TunnelAddress::new("127.0.0.1", remote_port, "127.0.0.1", 0),
    )
}

#[tokio::test]
async fn forwards_traffic() {
    let echo = echo_server().await;
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = tunnel(&t, echo.port());
    tunnel.up().await.unwrap();
    assert!(tunnel.is_up());

    let mut conn = TcpStream::connect(tunnel.local_addr().unwrap())
        .await
        .unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(t.dials(), vec![echo]);

    tunnel.stop().await;
}

#[tokio::test]
async fn up_twice_fails() {
    let echo = echo_server().await;
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = tunnel(&t, echo.port());
    tunnel.up().await.unwrap();

    let err = tunnel.up().await.unwrap_err();
    assert!(
        matches!(err, NodeError::Tunnel(TunnelError::AlreadyUp { .. })),
        "{err}"
    );
    tunnel.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let echo = echo_server().await;
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = tunnel(&t, echo.port());

    tunnel.stop().await;
    tunnel.up().await.unwrap();
    let local = tunnel.local_addr().unwrap();
    assert_eq!(t.live_proxies(), 1);

    tunnel.stop().await;
    tunnel.stop().await;
    assert!(!tunnel.is_up());
    assert_eq!(t.live_proxies(), 0);
    assert!(TcpStream::connect(local).await.is_err());
}

#[tokio::test]
async fn dial_failure_goes_to_error_feed() {
    let port = closed_port().await;
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = tunnel(&t, port);
    let mut errors = tunnel.take_error_feed().unwrap();
    assert!(tunnel.take_error_feed().is_none());
    tunnel.up().await.unwrap();

    let _conn = TcpStream::connect(tunnel.local_addr().unwrap())
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, TunnelError::Dial { .. }), "{err}");
    assert!(tunnel.is_up());

    tunnel.stop().await;
}

#[tokio::test]
async fn bind_conflict_fails_up() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = Tunnel::new(
        t.clone(),
        TunnelAddress::new("127.0.0.1", 6445, "127.0.0.1", port),
    );

    let err = tunnel.up().await.unwrap_err();
    assert!(
        matches!(err, NodeError::Tunnel(TunnelError::Bind { .. })),
        "{err}"
    );
    assert!(!tunnel.is_up());
    assert_eq!(t.live_proxies(), 0);
}

#[tokio::test]
async fn client_stop_closes_tunnel() {
    let echo = echo_server().await;
    let t = Arc::new(FakeTransport::new("node-0"));
    let tunnel = tunnel(&t, echo.port());
    tunnel.up().await.unwrap();

    t.cancel_proxies();
    assert!(!tunnel.is_up());

    // A tunnel closed from outside can be brought up again.
    tunnel.up().await.unwrap();
    assert!(tunnel.is_up());
    tunnel.stop().await;
}

#[tokio::test]
async fn parse_rejects_bad_address() {
    let t = Arc::new(FakeTransport::new("node-0"));
    let err = Tunnel::parse(t, "127.0.0.1:6445:localhost").unwrap_err();
    assert!(
        matches!(err, NodeError::Tunnel(TunnelError::InvalidAddress { .. })),
        "{err}"
    );
}
