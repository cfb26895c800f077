//! Reverse tunnel and health monitor tests.
//!
//! Needs the `test-utils` feature, which the dev-dependency on this crate enables.

#![cfg(feature = "test-utils")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rust_node_ssh::{
    ClientConfig, FakeTransport, HealthMonitorConfig, NodeError, Result, ReverseTunnel,
    ReverseTunnelChecker, ReverseTunnelKiller, ReverseTunnelState, TunnelAddress, TunnelError,
};

#[derive(Default)]
struct Probe {
    failing: AtomicBool,
    checks: AtomicUsize,
    kills: AtomicUsize,
}

impl Probe {
    fn failing() -> Arc<Self> {
        let probe = Self::default();
        probe.failing.store(true, Ordering::SeqCst);
        Arc::new(probe)
    }

    fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ReverseTunnelChecker for Probe {
    fn check_tunnel(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(NodeError::config("healthz unreachable"))
            } else {
                Ok("OK\n".to_string())
            }
        })
    }
}

impl ReverseTunnelKiller for Probe {
    fn kill_tunnel(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        })
    }
}

fn transport(max_restarts: u32) -> Arc<FakeTransport> {
    let health = HealthMonitorConfig::new()
        .interval(Duration::from_millis(20))
        .check_retries(2)
        .retry_delay(Duration::from_millis(5))
        .max_restarts(max_restarts);
    Arc::new(FakeTransport::new("node-0").with_config(ClientConfig::default().health(health)))
}

fn reverse_tunnel(t: &Arc<FakeTransport>) -> ReverseTunnel {
    ReverseTunnel::new(
        t.clone(),
        TunnelAddress::new("127.0.0.1", 6445, "127.0.0.1", 6443),
    )
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn up_and_stop() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    assert_eq!(tunnel.state(), ReverseTunnelState::Stopped);

    tunnel.up().await.unwrap();
    assert_eq!(tunnel.state(), ReverseTunnelState::Up);
    assert_eq!(tunnel.invocation_id().await, Some(1));
    assert_eq!(t.forwarder().active(), 1);
    assert_eq!(
        t.forwarder().addresses(),
        vec![TunnelAddress::new("127.0.0.1", 6445, "127.0.0.1", 6443)]
    );

    let err = tunnel.up().await.unwrap_err();
    assert!(
        matches!(err, NodeError::Tunnel(TunnelError::AlreadyUp { .. })),
        "{err}"
    );

    tunnel.stop().await;
    assert_eq!(tunnel.state(), ReverseTunnelState::Stopped);
    assert_eq!(tunnel.invocation_id().await, None);
    assert_eq!(t.forwarder().active(), 0);

    // Stopping again is a no-op.
    tunnel.stop().await;
}

#[tokio::test]
async fn refused_forward_leaves_tunnel_stopped() {
    let t = transport(5);
    t.forwarder().set_failing(true);
    let tunnel = reverse_tunnel(&t);

    assert!(tunnel.up().await.is_err());
    assert_eq!(tunnel.state(), ReverseTunnelState::Stopped);
    assert_eq!(tunnel.invocation_id().await, None);
}

#[tokio::test]
async fn exit_is_reported_without_monitor() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();

    assert!(t.forwarder().end_latest("connection reset"));
    let exit = tokio::time::timeout(Duration::from_secs(5), tunnel.next_exit())
        .await
        .unwrap()
        .unwrap();
    match exit {
        TunnelError::Exited { id, reason } => {
            assert_eq!(id, 1);
            assert_eq!(reason, "connection reset");
        }
        other => panic!("unexpected exit: {other}"),
    }
}

#[tokio::test]
async fn dead_forward_leaves_tunnel_stopped() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();

    assert!(t.forwarder().end_latest("connection reset"));
    tokio::time::timeout(Duration::from_secs(5), tunnel.next_exit())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(tunnel.state(), ReverseTunnelState::Stopped);
    assert_eq!(tunnel.invocation_id().await, None);
    assert_eq!(t.forwarder().active(), 0);

    tunnel.up().await.unwrap();
    assert_eq!(tunnel.state(), ReverseTunnelState::Up);
    assert_eq!(tunnel.invocation_id().await, Some(2));
    assert_eq!(t.forwarder().requested(), 2);
    tunnel.stop().await;
}

#[tokio::test]
async fn monitor_restarts_exited_tunnel() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();
    let probe = Arc::new(Probe::default());
    let monitor = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap();

    assert!(t.forwarder().end_latest("connection reset"));
    eventually("restart", || t.forwarder().requested() == 2).await;
    eventually("tunnel up", || tunnel.state() == ReverseTunnelState::Up).await;

    assert_eq!(probe.kills(), 1);
    assert_eq!(tunnel.invocation_id().await, Some(2));
    assert_eq!(t.forwarder().active(), 1);

    tunnel.stop().await;
    monitor.wait().await.unwrap();
}

#[tokio::test]
async fn monitor_restarts_after_failed_checks() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();
    let probe = Probe::failing();
    let monitor = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap();

    eventually("restart", || t.forwarder().requested() >= 2).await;
    probe.failing.store(false, Ordering::SeqCst);
    assert!(probe.checks.load(Ordering::SeqCst) >= 2);
    assert!(probe.kills() >= 1);

    let restarts = t.forwarder().requested();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.forwarder().requested() <= restarts + 1);
    assert_eq!(tunnel.state(), ReverseTunnelState::Up);

    monitor.stop();
    monitor.wait().await.unwrap();
    tunnel.stop().await;
}

#[tokio::test]
async fn monitor_gives_up() {
    let t = transport(2);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();
    let probe = Probe::failing();
    let monitor = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), monitor.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, NodeError::HealthMonitorGaveUp { restarts: 2, .. }),
        "{err}"
    );
    assert_eq!(probe.kills(), 2);
    assert_eq!(t.forwarder().requested(), 3);

    // The monitor slot is free again.
    let again = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap();
    again.stop();
    tunnel.stop().await;
}

#[tokio::test]
async fn second_monitor_is_rejected() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    tunnel.up().await.unwrap();
    let probe = Arc::new(Probe::default());
    let monitor = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap();

    let err = tunnel
        .start_health_monitor(probe.clone(), probe.clone())
        .unwrap_err();
    assert!(
        matches!(err, NodeError::Tunnel(TunnelError::MonitorRunning { .. })),
        "{err}"
    );

    tunnel.stop().await;
    monitor.wait().await.unwrap();
}

#[tokio::test]
async fn state_changes_are_observable() {
    let t = transport(5);
    let tunnel = reverse_tunnel(&t);
    let mut states = tunnel.subscribe();

    tunnel.up().await.unwrap();
    states
        .wait_for(|s| *s == ReverseTunnelState::Up)
        .await
        .unwrap();
    tunnel.stop().await;
    states
        .wait_for(|s| *s == ReverseTunnelState::Stopped)
        .await
        .unwrap();
}
