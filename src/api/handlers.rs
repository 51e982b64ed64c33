//! Session CRUD and health endpoints. Each handler takes an
//! `Extension<Arc<AppState>>` plus whatever axum extractors the route
//! needs, returning `Result<impl IntoResponse, ApiError>` so `?` does
//! the status-code mapping.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub instructor_id: String,
    pub student_ids: Vec<String>,
}

/// `POST /api/sessions`
#[instrument(skip(state, req))]
pub async fn create_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .session_manager
        .create_session(req.name, req.instructor_id, req.student_ids)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

/// `GET /api/sessions`
pub async fn list_sessions_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let sessions: Vec<_> = state
        .session_manager
        .list_active_sessions()
        .into_iter()
        .map(|session| {
            let connection_count = state.hub.registry().get_session_connections(&session.id).len();
            json!({
                "session": session,
                "connection_count": connection_count,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions }))
}

/// `GET /api/sessions/{id}`
pub async fn get_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.session_manager.get_session(&id)?;
    let connection_count = state.hub.registry().get_session_connections(&id).len();

    Ok(Json(json!({
        "session": session,
        "connection_count": connection_count,
    })))
}

/// `DELETE /api/sessions/{id}` — ends the session. Broadcasts
/// `system{event:"session_ended"}` to every currently connected
/// participant before the persisted status update completes — the
/// broadcast is best-effort and not blocked on individual deliveries —
/// then closes their connections with a normal closure.
#[instrument(skip(state))]
pub async fn delete_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let connections = state.hub.registry().get_session_connections(&id);
    for conn in &connections {
        state.hub.router().send_session_ended(conn);
    }

    // `end_session` distinguishes an absent session (404) from one
    // that's already ended (400) by falling back to the store on a
    // cache miss.
    let ended = state.session_manager.end_session(&id).await?;

    for conn in connections {
        state.hub.unregister(conn);
    }

    Ok((StatusCode::OK, Json(json!({ "session": ended }))))
}

/// `GET /health` — database and connection health payload.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let db_healthy = state.store.health_check().await.is_ok();
    let stats = state.hub.registry().stats();

    let status = if db_healthy { "healthy" } else { "unhealthy" };
    let code = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": status,
        "timestamp": Utc::now(),
        "database": if db_healthy { "ok" } else { "unreachable" },
        "connections": {
            "total": stats.total_connections,
            "instructors": stats.instructor_connections,
            "students": stats.student_connections,
            "sessions": stats.sessions_with_connections,
        },
        "system": {
            "active_sessions": state.session_manager.list_active_sessions().len(),
        },
    }));

    (code, body)
}
