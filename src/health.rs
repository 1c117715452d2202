//! Health endpoints
//!
//! `/healthz` answers as soon as the process is up. `/readyz` answers 200
//! only once certificates are mounted and the CA has been injected.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use certwarden_common::Signal;

/// Router exposing `/healthz` and `/readyz`
pub fn router(ready: Signal) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<Signal>) -> (StatusCode, &'static str) {
    if ready.is_fired() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "certificates not ready")
    }
}

/// Serve health endpoints on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    ready: Signal,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");
    axum::serve(listener, router(ready))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
