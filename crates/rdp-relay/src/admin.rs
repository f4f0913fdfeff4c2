//! Read-only HTTP surface: health, metrics, sessions and pool rows

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::{get, Router},
    Json,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::metrics::RelayMetrics;
use crate::pool::Pool;
use crate::registry::{SessionInfo, SessionRegistry};
use crate::store::BackendRow;

#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<Pool>,
    pub registry: SessionRegistry,
    pub metrics: Arc<RelayMetrics>,
}

/// Admin API
pub struct AdminApi {
    state: AdminState,
}

impl AdminApi {
    pub fn new(pool: Arc<Pool>, registry: SessionRegistry, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            state: AdminState {
                pool,
                registry,
                metrics,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions", get(list_sessions))
            .route("/backends", get(list_backends))
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
    pub assigned: usize,
    pub connected: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub backends: Vec<BackendRow>,
    pub total: usize,
    pub free: usize,
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<AdminState>) -> Result<Response<String>, StatusCode> {
    match state.metrics.export() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn list_sessions(State(state): State<AdminState>) -> Json<SessionsResponse> {
    let sessions = state.registry.snapshot();
    Json(SessionsResponse {
        assigned: sessions.len(),
        connected: state.registry.count(),
        sessions,
        uptime_seconds: state.metrics.uptime().as_secs(),
    })
}

async fn list_backends(
    State(state): State<AdminState>,
) -> Result<Json<BackendsResponse>, StatusCode> {
    let backends = state.pool.backends().await.map_err(|e| {
        warn!("Admin API: backend listing failed: {}", e);
        state.metrics.record_store_error();
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    let free = backends.iter().filter(|row| row.is_free()).count();
    Ok(Json(BackendsResponse {
        total: backends.len(),
        free,
        backends,
    }))
}
