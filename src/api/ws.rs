//! The websocket upgrade handshake and per-connection read/write loop:
//! query-param authentication, a split socket with a dedicated writer
//! task, and a `select!` loop over inbound frames, a ping interval, and
//! an idle-timeout sleep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use crate::connection::Connection;
use crate::error::ApiError;
use crate::server::AppState;
use crate::types::{is_valid_identifier, InboundMessage, Message, MessageType, Role};

/// Parses and validates `user_id`, `role`, `session_id` from the upgrade
/// query string, returning a JSON 400 body on the first problem found
/// rather than axum's default query-rejection page.
fn parse_handshake_params(params: &HashMap<String, String>) -> Result<(String, Role, String), ApiError> {
    let user_id = params
        .get("user_id")
        .ok_or_else(|| ApiError::BadRequest("missing user_id".into()))?
        .clone();
    let session_id = params
        .get("session_id")
        .ok_or_else(|| ApiError::BadRequest("missing session_id".into()))?
        .clone();
    let role_str = params
        .get("role")
        .ok_or_else(|| ApiError::BadRequest("missing role".into()))?;
    let role: Role = role_str
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown role: {role_str}")))?;

    if !is_valid_identifier(&user_id) {
        return Err(ApiError::BadRequest("invalid user_id".into()));
    }
    if !is_valid_identifier(&session_id) {
        return Err(ApiError::BadRequest("invalid session_id".into()));
    }

    Ok((user_id, role, session_id))
}

/// `GET /ws?user_id=&role=&session_id=`
pub async fn ws_upgrade(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (user_id, role, session_id) = match parse_handshake_params(&params) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    // spec.md §7: authorization errors are reported as HTTP 403/404 for
    // plain REST endpoints, but "upgrade refused with 403 for WS" holds
    // regardless of which authorization error the session manager
    // reports (absent session, ended session, or unenrolled student) —
    // unlike `GET`/`DELETE /api/sessions/{id}`, the WS handshake never
    // distinguishes "not found" from "not allowed" for an unauthorized
    // caller.
    if let Err(e) = state.session_manager.validate_membership(&session_id, &user_id, role) {
        return ApiError::Forbidden(e.to_string()).into_response();
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("ws_session", session_id = %session_id, user_id = %user_id, %role);
        async move { handle_socket(state, user_id, role, session_id, socket).await }.instrument(span)
    })
}

async fn handle_socket(state: Arc<AppState>, user_id: String, role: Role, session_id: String, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let conn = Connection::spawn_with_config(
        ws_tx,
        state.config.websocket.buffer_size,
        Duration::from_secs(state.config.websocket.write_timeout),
    );

    if conn.set_credentials(user_id.clone(), role, session_id.clone()).is_err() {
        conn.close();
        return;
    }
    if !state.hub.register(conn.clone()) {
        warn!("hub intake full during registration, dropping connection");
        conn.close();
        return;
    }

    if let Err(e) = replay_history(&state, &conn, &user_id, role, &session_id).await {
        warn!(error = %e, "history replay failed");
    }
    state.hub.router().send_history_complete(&conn);

    let ping_interval = Duration::from_secs(state.config.websocket.ping_interval);
    let read_timeout = Duration::from_secs(state.config.websocket.read_timeout);
    let mut ping_tick = tokio::time::interval(ping_interval);
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if conn.send_ping().is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_rx = Instant::now();
                        handle_inbound_text(&state, &conn, &text);
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(last_rx + read_timeout) => {
                info!("idle timeout, closing connection");
                break;
            }
        }
    }

    state.hub.unregister(conn);
}

fn handle_inbound_text(state: &Arc<AppState>, conn: &Arc<Connection>, text: &str) {
    let inbound: InboundMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = conn.write_frame(&json!({
                "type": "system",
                "context": "message_error",
                "content": {"error": "InvalidMessageType", "message": e.to_string()},
                "timestamp": chrono::Utc::now(),
            }));
            return;
        }
    };

    if !state.hub.send_message(inbound, conn.clone()) {
        let _ = conn.write_frame(&json!({
            "type": "system",
            "context": "message_error",
            "content": {"error": "HubFull", "message": "server is busy, try again"},
            "timestamp": chrono::Utc::now(),
        }));
    }
}

/// Streams this session's history to `conn`, filtered by role:
/// instructors see everything; students see broadcasts, their own
/// messages, and direct messages addressed to them. Reuses the exact
/// recipient rule the Router applies at delivery time rather than
/// reimplementing it, so replay can never drift from live delivery.
async fn replay_history(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    user_id: &str,
    role: Role,
    session_id: &str,
) -> Result<(), crate::error::StoreError> {
    let history = state.store.get_session_history(session_id).await?;

    for message in history {
        if is_visible_to(&message, user_id, role) {
            let _ = conn.write_frame(&message);
        }
    }
    Ok(())
}

fn is_visible_to(message: &Message, user_id: &str, role: Role) -> bool {
    match role {
        Role::Instructor => true,
        Role::Student => {
            message.message_type == MessageType::InstructorBroadcast
                || message.from_user == user_id
                || message.to_user.as_deref() == Some(user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Content;

    fn msg(message_type: MessageType, from: &str, to: Option<&str>) -> Message {
        Message {
            id: "m1".into(),
            session_id: "s1".into(),
            message_type,
            context: "general".into(),
            from_user: from.into(),
            to_user: to.map(String::from),
            content: Content(serde_json::json!({})),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn instructor_sees_everything() {
        let m = msg(MessageType::InstructorInbox, "alice", None);
        assert!(is_visible_to(&m, "prof", Role::Instructor));
    }

    #[test]
    fn student_sees_broadcasts_own_messages_and_direct_replies() {
        let broadcast = msg(MessageType::InstructorBroadcast, "prof", None);
        assert!(is_visible_to(&broadcast, "alice", Role::Student));

        let own_question = msg(MessageType::InstructorInbox, "alice", None);
        assert!(is_visible_to(&own_question, "alice", Role::Student));

        let direct_reply = msg(MessageType::InboxResponse, "prof", Some("alice"));
        assert!(is_visible_to(&direct_reply, "alice", Role::Student));
    }

    #[test]
    fn student_does_not_see_other_students_traffic() {
        let other_question = msg(MessageType::InstructorInbox, "bob", None);
        assert!(!is_visible_to(&other_question, "alice", Role::Student));

        let other_reply = msg(MessageType::InboxResponse, "prof", Some("bob"));
        assert!(!is_visible_to(&other_reply, "alice", Role::Student));
    }

    #[test]
    fn handshake_params_reject_missing_and_malformed_fields() {
        let mut params = HashMap::new();
        assert!(parse_handshake_params(&params).is_err());

        params.insert("user_id".to_string(), "alice".to_string());
        params.insert("role".to_string(), "student".to_string());
        params.insert("session_id".to_string(), "s1".to_string());
        assert!(parse_handshake_params(&params).is_ok());

        params.insert("role".to_string(), "wizard".to_string());
        assert!(parse_handshake_params(&params).is_err());
    }
}
