//! Administrative HTTP surface and the hub's WebSocket transport.
//!
//! Routes:
//! - `GET    /health`                  liveness check
//! - `GET    /metrics`                 Prometheus exposition
//! - `GET    /admin/jobs`              job registry snapshot
//! - `POST   /admin/jobs/:id/run`      run a job now
//! - `DELETE /admin/jobs/:id`          unregister a job
//! - `GET    /admin/health-report`     run a health pass and return it
//! - `GET    /admin/cache/stats`       cache and query statistics
//! - `POST   /admin/cache/invalidate`  drop cache entries by pattern
//! - `POST   /admin/cache/reset-stats` clear query latency statistics
//! - `GET    /ws`                      live updates

pub mod cache;
pub mod health;
pub mod jobs;
pub mod ws;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::cache::QueryCache;
use crate::health::HealthMonitor;
use crate::hub::BroadcastHub;
use crate::metrics::AppMetrics;
use crate::scheduler::JobScheduler;

/// Handles shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<QueryCache>,
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<AppMetrics>,
}

/// Error shape returned by every JSON route.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Assemble the complete router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/admin/health-report", get(health::health_report))
        .route("/admin/jobs", get(jobs::list_jobs))
        .route("/admin/jobs/:id", delete(jobs::delete_job))
        .route("/admin/jobs/:id/run", post(jobs::run_job))
        .route("/admin/cache/stats", get(cache::cache_stats))
        .route("/admin/cache/invalidate", post(cache::invalidate))
        .route("/admin/cache/reset-stats", post(cache::reset_stats))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
