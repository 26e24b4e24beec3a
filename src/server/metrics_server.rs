// src/server/metrics_server.rs

//! The optional HTTP exporter: Prometheus text on `/metrics` and the committed JSON
//! status of one cluster on `/clusters/{name}`.

use super::listener::MonitorRegistry;
use crate::core::metrics::gather_metrics;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

async fn cluster_status_handler(
    State(registry): State<MonitorRegistry>,
    Path(cluster): Path<String>,
) -> Response {
    // Clone the handle out so the registry shard is not locked while serializing.
    let handle = registry.get(&cluster).map(|entry| entry.value().clone());
    match handle {
        Some(handle) => Json(handle.snapshot().as_ref().clone()).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown cluster '{cluster}'")).into_response(),
    }
}

pub fn router(registry: MonitorRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/clusters/{cluster}", get(cluster_status_handler))
        .with_state(registry)
}

/// Serves the exporter on `port` until shutdown. A bind failure is logged and ends the
/// exporter without affecting the monitors.
pub async fn run_metrics_server(
    port: u16,
    registry: MonitorRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };
    info!("Metrics exporter listening on http://{}/metrics", addr);

    let served = axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await;
    if let Err(e) = served {
        error!("Metrics server failed: {}", e);
    }
}
