//! The `/healthz` endpoint probed through reverse tunnels.
//!
//! Checker scripts on the remote host request `GET /healthz` through the
//! tunnel and expect status 200 with body `OK\n`. [`serve_healthz`] answers
//! that on the local side; [`probe`] performs the same request, for local
//! checks and tests.

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, Result};

/// Path served by [`serve_healthz`].
pub const HEALTHZ_PATH: &str = "/healthz";

/// Body of a healthy response.
pub const HEALTHZ_BODY: &str = "OK\n";

/// Upper bound on one [`probe`] request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 200 with the expected body.
    Healthy,
    /// Anything else.
    Unhealthy {
        /// What was wrong with the response.
        reason: String,
    },
}

impl HealthStatus {
    /// Check if healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Routes of the health endpoint. Anything but `GET /healthz` is a 404.
pub fn router() -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz).fallback(not_found))
        .fallback(not_found)
}

async fn healthz() -> &'static str {
    HEALTHZ_BODY
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Answer health requests on `listener` until `cancel` fires.
pub async fn serve_healthz(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|e| NodeError::io_context("failed to read health endpoint address", e))?;
    tracing::info!(address = %local, "Serving health endpoint");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| NodeError::io_context("health endpoint failed", e))?;

    tracing::debug!(address = %local, "Health endpoint stopped");
    Ok(())
}

/// Request `GET /healthz` from `address` (`host:port`).
pub async fn probe(address: &str) -> Result<HealthStatus> {
    let url = format!("http://{address}{HEALTHZ_PATH}");
    let http_error = |source| NodeError::Health {
        url: url.clone(),
        source,
    };

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()
        .map_err(http_error)?;
    let response = client.get(&url).send().await.map_err(http_error)?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Ok(HealthStatus::Unhealthy {
            reason: format!("unexpected status {status}"),
        });
    }
    let body = response.text().await.map_err(http_error)?;
    if body != HEALTHZ_BODY {
        return Ok(HealthStatus::Unhealthy {
            reason: format!("unexpected body `{}`", body.trim_end()),
        });
    }
    Ok(HealthStatus::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_healthz() -> (String, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_healthz(listener, cancel.clone()));
        (address, cancel, server)
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let (address, cancel, server) = spawn_healthz().await;

        assert_eq!(probe(&address).await.unwrap(), HealthStatus::Healthy);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let (address, cancel, _server) = spawn_healthz().await;

        let client = reqwest::Client::new();
        let reply = client
            .get(format!("http://{address}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(reply.status(), reqwest::StatusCode::NOT_FOUND);

        let reply = client
            .post(format!("http://{address}{HEALTHZ_PATH}"))
            .send()
            .await
            .unwrap();
        assert_eq!(reply.status(), reqwest::StatusCode::NOT_FOUND);
        cancel.cancel();
    }

    #[tokio::test]
    async fn chunked_reply_is_read_as_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nOK\n\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
        });

        assert_eq!(probe(&address).await.unwrap(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn wrong_body_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let app = Router::new().route(HEALTHZ_PATH, get(|| async { "starting\n" }));
        tokio::spawn(async move { axum::serve(listener, app).await });

        let status = probe(&address).await.unwrap();
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = probe(&address).await.unwrap_err();
        assert!(matches!(err, NodeError::Health { .. }), "{err}");
    }
}
