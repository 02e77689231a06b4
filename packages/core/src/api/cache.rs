use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::cache::CacheStats;

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    /// Substring of the readable key. Absent or null clears everything.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: &'static str,
}

/// `GET /admin/cache/stats`
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

/// `POST /admin/cache/invalidate`
pub async fn invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateRequest>,
) -> Json<InvalidateResponse> {
    let removed = state.cache.invalidate(body.pattern.as_deref()).await;
    tracing::info!(
        "Admin cache invalidation ({}) removed {} entries",
        body.pattern.as_deref().unwrap_or("all"),
        removed
    );
    Json(InvalidateResponse { removed })
}

/// `POST /admin/cache/reset-stats`
///
/// Clears the query latency counters and the slow-call log. Cached entries
/// and hit/miss totals are left alone.
pub async fn reset_stats(State(state): State<AppState>) -> Json<ResetResponse> {
    state.cache.monitor().reset();
    Json(ResetResponse {
        success: true,
        message: "Query statistics reset",
    })
}
