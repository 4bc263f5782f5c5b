use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::{realtime_sse_stream, AppServices};
use crate::context::UserContext;

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

pub async fn whoami(Extension(user): Extension<UserContext>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "user_id": user.user_id().to_string(),
            "roles": user.roles().iter().map(|r| r.as_str().to_string()).collect::<Vec<_>>(),
        })),
    )
}

/// SSE stream of projection updates and reconciliation progress.
pub async fn stream(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    realtime_sse_stream(services)
}
