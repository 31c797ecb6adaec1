//! HTTP status endpoint: health, connected clients, and relay counters as JSON.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::relay::{ClientInfo, ClientRegistry, RelayStats};

/// Shared state for status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub registry: Arc<ClientRegistry>,
    /// Port the relay is actually listening on (reported by `GET /`).
    pub relay_port: u16,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/clients", get(clients_http))
        .route("/stats", get(stats_http))
        .with_state(state)
}

/// Serve the status router on `listener` until `shutdown` resolves.
pub async fn serve_status<F>(listener: TcpListener, state: StatusState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("status endpoint exited")
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<StatusState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.relay_port,
        "clients": state.registry.len().await,
    }))
}

async fn clients_http(State(state): State<StatusState>) -> Json<Vec<ClientInfo>> {
    Json(state.registry.clients().await)
}

async fn stats_http(State(state): State<StatusState>) -> Json<RelayStats> {
    Json(state.registry.stats())
}
