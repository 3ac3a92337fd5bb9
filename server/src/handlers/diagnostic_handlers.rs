use axum::{extract::Path, http::StatusCode, response::IntoResponse, Extension, Json};
use netdiag_cli::controller::{Job, Submission};
use netdiag_cli::error::SubmitError;
use netdiag_cli::Tool;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Deserialize)]
pub struct SubmitPayload {
    pub tool: Tool,
    pub target: String,
}

#[derive(Deserialize)]
pub struct SwitchToolPayload {
    pub tool: Tool,
}

#[derive(Serialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub submission: Submission,
    pub job: Job,
}

fn session_not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "Session not found" })),
    )
}

/// GET /api/tools
pub async fn list_tools(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(json!({ "tools": state.tools.as_slice() }))
}

/// POST /api/sessions
pub async fn create_session(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let session_id = state.open_session();
    info!(%session_id, "session opened");
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

/// GET /api/sessions/{sessionId}
pub async fn get_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let controller = state.session(&session_id).ok_or_else(session_not_found)?;
    Ok(Json(controller.snapshot()))
}

/// POST /api/sessions/{sessionId}/submit
pub async fn submit_job(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SubmitPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.session(&session_id).ok_or_else(session_not_found)?;

    if !state.is_enabled(payload.tool) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": format!("{} is not enabled", payload.tool) })),
        ));
    }

    let submission = controller
        .submit(payload.tool, &payload.target)
        .map_err(|e| match e {
            SubmitError::EmptyTarget => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "Please enter a target host or IP." })),
            ),
        })?;

    let status = match submission {
        Submission::Started { .. } => StatusCode::ACCEPTED,
        Submission::CacheHit | Submission::AlreadyRunning => StatusCode::OK,
    };
    let job = controller.snapshot();
    Ok((status, Json(SubmitResponse { submission, job })))
}

/// POST /api/sessions/{sessionId}/tool
pub async fn switch_tool(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SwitchToolPayload>,
) -> Result<Json<Job>, ApiError> {
    let controller = state.session(&session_id).ok_or_else(session_not_found)?;
    if !state.is_enabled(payload.tool) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": format!("{} is not enabled", payload.tool) })),
        ));
    }
    controller.switch_tool(payload.tool);
    Ok(Json(controller.snapshot()))
}

/// POST /api/sessions/{sessionId}/reset
pub async fn reset_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let controller = state.session(&session_id).ok_or_else(session_not_found)?;
    controller.reset();
    Ok(Json(controller.snapshot()))
}

/// DELETE /api/sessions/{sessionId}
pub async fn close_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    // Dropping the last handle to the controller aborts its pending job.
    state
        .sessions
        .remove(&session_id)
        .ok_or_else(session_not_found)?;
    info!(%session_id, "session closed");
    Ok(StatusCode::NO_CONTENT)
}
