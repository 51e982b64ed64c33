//! Router composition: plain routes merged under a permissive CORS layer
//! and a request-tracing layer, with `Arc<AppState>` injected via
//! `Extension`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{
    create_session_handler, delete_session_handler, get_session_handler, health_handler,
    list_sessions_handler,
};
use crate::api::ws::ws_upgrade;
use crate::server::AppState;

/// Builds the full HTTP/WS surface. CORS is wide open — there is no
/// per-deployment origin allow-list to configure, since this system has
/// no notion of a trusted vs. untrusted origin at the HTTP layer.
///
/// `http.write_timeout` bounds request-handling time on the plain JSON
/// endpoints, applied only to those routes: `/ws` is long-lived by
/// design and enforces its own read/write timeouts per spec.md §4.8
/// inside the upgrade handler's read/write loop, so a request-scoped
/// timeout here would otherwise kill every websocket session after
/// `write_timeout` seconds. `http.read_timeout` is accepted as a
/// configuration key (spec.md §6 enumerates it) but not independently
/// enforced — axum's listener doesn't expose a distinct
/// connection-level read timeout the way a raw TCP server might.
pub fn create_router(state: Arc<AppState>) -> Router {
    let write_timeout = Duration::from_secs(state.config.http.write_timeout);
    let api_routes = Router::new()
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/:id", get(get_session_handler))
        .route("/api/sessions/:id", delete(delete_session_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(move |req, next| {
            enforce_write_timeout(write_timeout, req, next)
        }));

    Router::new()
        .merge(api_routes)
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

/// Bounds a single request's handling time to `write_timeout`, returning
/// a 503 JSON body in the same `{error, code, message}` shape as
/// `ApiError` if the handler doesn't finish in time.
async fn enforce_write_timeout(write_timeout: Duration, req: Request, next: Next) -> Response {
    match tokio::time::timeout(write_timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "request_timeout",
                "code": StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                "message": "request exceeded http.write_timeout",
            })),
        )
            .into_response(),
    }
}
