//! Health and metrics endpoints
//!
//! - `GET /health`: the process is up
//! - `GET /ready`: the database subsystem is running (503 otherwise)
//! - `GET /metrics`: Prometheus text format

use crate::db::Database;
use crate::metrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Ready check endpoint
pub async fn ready(State(database): State<Arc<Database>>) -> impl IntoResponse {
    if database.is_running() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "database subsystem stopped")
    }
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

pub fn router(database: Arc<Database>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .with_state(database)
}

/// Serve the endpoints until the process exits
pub async fn serve(port: u16, database: Arc<Database>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP health/metrics server listening");
    axum::serve(listener, router(database)).await?;
    Ok(())
}
