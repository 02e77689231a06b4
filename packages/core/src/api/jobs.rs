use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::{api_error, ApiError, AppState};
use crate::scheduler::{JobError, JobSnapshot};

/// `GET /admin/jobs`
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.scheduler.introspect().await)
}

/// `POST /admin/jobs/:id/run` runs the job to completion and reports its
/// outcome. The failure is also recorded and alerted like a scheduled fire.
pub async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.scheduler.run_now(&id, true).await {
        Ok(()) => {
            let snapshot = state.scheduler.snapshot(&id).await;
            Ok(Json(json!({ "status": "success", "job": snapshot })))
        }
        Err(err @ JobError::NotFound(_)) => Err(api_error(StatusCode::NOT_FOUND, err.to_string())),
        Err(err) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

/// `DELETE /admin/jobs/:id`
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.scheduler.unregister(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            JobError::NotFound(id).to_string(),
        ))
    }
}
