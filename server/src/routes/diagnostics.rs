use axum::routing::{get, post};
use axum::{Extension, Router};

use crate::handlers::diagnostic_handlers::{
    close_session, create_session, get_session, list_tools, reset_session, submit_job, switch_tool,
};
use crate::state::AppState;

pub fn diagnostics_routes(state: AppState) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/sessions", post(create_session))
        .route("/sessions/{sessionId}", get(get_session).delete(close_session))
        .route("/sessions/{sessionId}/submit", post(submit_job))
        .route("/sessions/{sessionId}/tool", post(switch_tool))
        .route("/sessions/{sessionId}/reset", post(reset_session))
        .layer(Extension(state))
}
