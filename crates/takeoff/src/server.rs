//! HTTP API for scheduling user notifications.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use takeoff_scheduler::{JobStore, NotificationPlanner, SchedulerError};

/// Shared application state.
pub struct AppState {
    pub planner: NotificationPlanner,
    pub store: Arc<dyn JobStore>,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/user", post(create_user))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    uid: String,
    time_zone: String,
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
enum ApiError {
    #[error("invalid request body: {0}")]
    Body(#[from] JsonRejection),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
            ApiError::Scheduler(
                SchedulerError::InvalidRequest(_) | SchedulerError::InvalidTimeZone(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Scheduler(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!(error = %self, "scheduling request failed");
        }

        let body = json!({ "success": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    let plan = state
        .planner
        .schedule_user(&request.uid, &request.time_zone)?;

    info!(
        uid = %request.uid,
        time_zone = %request.time_zone,
        jobs = plan.jobs.len(),
        "user scheduled"
    );
    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "jobs": stats })),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": e.to_string() })),
            )
        }
    }
}
