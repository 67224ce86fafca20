//! Metrics HTTP server
//!
//! Exposes the router's Prometheus registry and a health summary over HTTP.
//!
//! ## Endpoints
//!
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /health` - session and arm counts as JSON
//! - `POST /arms/:arm_id/revive` - return a retired arm to rotation
//!
//! ## Scraping with Prometheus
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: 'stream-router'
//!     static_configs:
//!       - targets: ['localhost:9090']
//! ```

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::PrometheusSink;
use crate::orchestrator::Orchestrator;
use crate::routing::ArmHealth;
use crate::{ArmId, OrchestratorError};

/// Shared state behind the endpoints.
#[derive(Debug, Clone)]
pub struct MetricsState {
    /// Registry rendered by `/metrics`.
    pub sink: Arc<PrometheusSink>,
    /// Router summarised by `/health`.
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the axum router.
pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/arms/:arm_id/revive", post(revive_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if binding or serving fails.
pub async fn start_server(
    addr: SocketAddr,
    state: MetricsState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), OrchestratorError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| OrchestratorError::Other(format!("metrics bind {addr} failed: {e}")))?;
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: MetricsState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), OrchestratorError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics server ready");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| OrchestratorError::Other(format!("metrics server failed: {e}")))
}

async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.sink.gather(),
    )
        .into_response()
}

async fn health_handler(State(state): State<MetricsState>) -> Response {
    let registry = state.orchestrator.registry();
    let retired = registry
        .ids()
        .iter()
        .filter(|id| registry.health(id) == Some(ArmHealth::Retired))
        .count();
    let health = serde_json::json!({
        "status": "healthy",
        "sessions": state.orchestrator.ledger().session_count(),
        "arms": registry.len(),
        "retiredArms": retired,
    });
    (StatusCode::OK, axum::Json(health)).into_response()
}

/// `POST /arms/:arm_id/revive`; 404 if the arm is unknown.
async fn revive_handler(
    State(state): State<MetricsState>,
    Path(arm_id): Path<String>,
) -> Response {
    let arm_id = ArmId::new(arm_id);
    if !state.orchestrator.revive_arm(&arm_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = serde_json::json!({
        "armId": arm_id,
        "health": "live",
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}
