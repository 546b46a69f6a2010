//! HTTP diagnostics: Prometheus metrics and a health probe.
//!
//! The endpoint is unauthenticated. Bind it to a loopback or otherwise
//! restricted address.

use crate::metrics::EngineMetrics;
use crate::tracker::CompletionTracker;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct DiagnosticsState {
    pub metrics: Arc<EngineMetrics>,
    pub tracker: Arc<CompletionTracker>,
}

pub fn create_router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

async fn health_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "in_flight": state.tracker.in_flight(),
    }))
}

/// Serve diagnostics on `listen` until `shutdown` fires.
///
/// A bind failure is logged and the run continues without the endpoint.
pub async fn serve(listen: String, state: DiagnosticsState, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(listen = %listen, error = %e, "Failed to bind diagnostics listener");
            return;
        }
    };
    tracing::info!(listen = %listen, "Diagnostics listening");

    let router = create_router(state);
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::warn!(error = %e, "Diagnostics server failed");
    }
}
