// Liveness endpoint exposing pool occupancy

use crate::manager::PoolManager;
use crate::pool::PoolStats;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pools: Vec<PoolStats>,
}

/// GET /health
pub async fn health(State(manager): State<Arc<PoolManager>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pools: manager.stats().await,
    })
}

pub fn router(manager: Arc<PoolManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(manager)
}

/// Serve until `stop_rx` flips to true
pub async fn serve(
    addr: &str,
    manager: Arc<PoolManager>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint to {}", addr))?;

    info!(addr = %addr, "Health endpoint listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move {
            while !*stop_rx.borrow() {
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Health endpoint failed")
}
