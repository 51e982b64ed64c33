//! Message validation, permission checks, persistence, and delivery. The
//! Router is the sole component that writes messages to persistence, and
//! the sole component that decides who receives one.

use std::sync::Arc;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::RouterError;
use crate::rate_limit::RateLimiter;
use crate::registry::Registry;
use crate::storage::Store;
use crate::types::{is_valid_context, normalize_context, Content, InboundMessage, Message, MessageType, Role};

pub struct Router {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    rate_limiter: RateLimiter,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            rate_limiter: RateLimiter::new(),
        }
    }

    pub fn prune_rate_limiter(&self) {
        self.rate_limiter.prune();
    }

    /// Runs the full ingress pipeline for one inbound frame from `sender`.
    /// Never panics and never propagates an error to the caller beyond
    /// logging it — failures are reported to `sender` as a `system` frame,
    /// and delivery-stage failures are swallowed (best effort).
    #[instrument(skip(self, inbound, sender), fields(user_id = sender.user_id().as_deref().unwrap_or("?")))]
    pub async fn route(&self, inbound: InboundMessage, sender: &Arc<Connection>) {
        if let Err(e) = self.route_inner(inbound, sender).await {
            self.send_error(sender, e);
        }
    }

    async fn route_inner(
        &self,
        inbound: InboundMessage,
        sender: &Arc<Connection>,
    ) -> Result<(), RouterError> {
        let (Some(from_user), Some(role), Some(session_id)) =
            (sender.user_id(), sender.role(), sender.session_id())
        else {
            return Err(RouterError::Forbidden);
        };

        // Step 1: ingress stamping. Any client-supplied id/from_user/
        // session_id/timestamp was never deserialized onto InboundMessage
        // in the first place (see types::InboundMessage) — here we assign
        // the server-side identity.
        let message_type = inbound.message_type;
        let context = normalize_context(&inbound.context);
        let content = inbound.content;
        let to_user = inbound.to_user;

        // Step 2: structural validation.
        if !message_type.is_client_sendable() {
            return Err(RouterError::InvalidMessageType);
        }
        if !is_valid_context(&context) {
            return Err(RouterError::InvalidContext);
        }
        if !content.within_size_limit().map_err(|_| RouterError::InvalidContent)? {
            return Err(RouterError::ContentTooLarge);
        }
        if message_type.requires_to_user() && to_user.is_none() {
            return Err(RouterError::MissingToUser);
        }
        if message_type.forbids_to_user() && to_user.is_some() {
            return Err(RouterError::UnexpectedToUser);
        }

        // Step 3: permission check.
        if message_type.sender_role() != Some(role) {
            return Err(RouterError::Forbidden);
        }

        // Step 4: rate limit.
        if !self.rate_limiter.check(&from_user) {
            return Err(RouterError::RateLimited);
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            message_type,
            context,
            from_user,
            to_user: to_user.clone(),
            content,
            timestamp: chrono::Utc::now(),
        };

        // Step 5: persist before any delivery is attempted.
        self.store
            .store_message(&message)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist message");
                RouterError::PersistenceFailed
            })?;

        // Step 6: recipients.
        let recipients = self.recipients_for(&session_id, message_type, to_user.as_deref());

        // Step 7: deliver, best-effort.
        for recipient in recipients {
            if recipient.write_frame(&message).is_err() {
                warn!(
                    recipient = recipient.user_id().as_deref().unwrap_or("?"),
                    "delivery failed, recipient queue full or closed"
                );
            }
        }

        Ok(())
    }

    fn recipients_for(
        &self,
        session_id: &str,
        message_type: MessageType,
        to_user: Option<&str>,
    ) -> Vec<Arc<Connection>> {
        match message_type {
            MessageType::InstructorInbox | MessageType::RequestResponse | MessageType::Analytics => {
                self.registry.get_session_instructors(session_id)
            }
            MessageType::InstructorBroadcast => self.registry.get_session_students(session_id),
            // Resolved against this session's own student roster, not a
            // global user_id lookup: an instructor has standing access to
            // every session (see sender_role), so a global lookup would
            // let `to_user` name a student connected under a different
            // session and leak this session's message to them there.
            MessageType::InboxResponse | MessageType::Request => to_user
                .and_then(|u| {
                    self.registry
                        .get_session_students(session_id)
                        .into_iter()
                        .find(|c| c.user_id().as_deref() == Some(u))
                })
                .into_iter()
                .collect(),
            MessageType::System => Vec::new(),
        }
    }

    fn send_error(&self, sender: &Arc<Connection>, error: RouterError) {
        let frame = SystemFrame {
            r#type: "system",
            context: "message_error",
            content: serde_json::json!({
                "error": error.kind(),
                "message": error.to_string(),
            }),
            timestamp: chrono::Utc::now(),
        };
        let _ = sender.write_frame(&frame);
    }

    /// Emits a `system{event: "session_ended"}` frame, used by the HTTP
    /// `DELETE /api/sessions/{id}` handler before it closes connections.
    pub fn send_session_ended(&self, conn: &Arc<Connection>) {
        let frame = SystemFrame {
            r#type: "system",
            context: "session_ended",
            content: serde_json::json!({"event": "session_ended"}),
            timestamp: chrono::Utc::now(),
        };
        let _ = conn.write_frame(&frame);
    }

    /// Emits a `system{event: "history_complete"}` frame, used once
    /// history replay finishes during the upgrade handshake.
    pub fn send_history_complete(&self, conn: &Arc<Connection>) {
        let frame = SystemFrame {
            r#type: "system",
            context: "history_complete",
            content: serde_json::json!({"event": "history_complete"}),
            timestamp: chrono::Utc::now(),
        };
        let _ = conn.write_frame(&frame);
    }
}

#[derive(serde::Serialize)]
struct SystemFrame {
    r#type: &'static str,
    context: &'static str,
    content: serde_json::Value,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use axum::extract::ws::Message as WsMessage;

    struct NullSink;
    impl futures_util::Sink<WsMessage> for NullSink {
        type Error = std::convert::Infallible;
        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn start_send(self: std::pin::Pin<&mut Self>, _item: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn conn(user_id: &str, role: Role, session_id: &str) -> Arc<Connection> {
        let c = Connection::spawn(NullSink);
        c.set_credentials(user_id.into(), role, session_id.into()).unwrap();
        c
    }

    fn router() -> (Router, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let router = Router::new(Arc::new(MemoryStore::new()), registry.clone());
        (router, registry)
    }

    fn inbound(message_type: MessageType, to_user: Option<&str>) -> InboundMessage {
        InboundMessage {
            message_type,
            context: String::new(),
            content: Content(serde_json::json!({"text": "hi"})),
            to_user: to_user.map(String::from),
        }
    }

    #[tokio::test]
    async fn student_broadcast_reaches_all_instructors() {
        let (router, registry) = router();
        let student = conn("alice", Role::Student, "s1");
        let instructor = conn("prof", Role::Instructor, "s1");
        registry.register(instructor.clone());
        registry.register(student.clone());

        router
            .route(inbound(MessageType::InstructorInbox, None), &student)
            .await;

        let history = router.store.get_session_history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_type, MessageType::InstructorInbox);
    }

    #[tokio::test]
    async fn wrong_role_is_rejected_without_persisting() {
        let (router, registry) = router();
        let student = conn("alice", Role::Student, "s1");
        registry.register(student.clone());

        router
            .route(inbound(MessageType::InstructorBroadcast, None), &student)
            .await;

        let history = router.store.get_session_history("s1").await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn request_without_to_user_is_rejected() {
        let (router, registry) = router();
        let instructor = conn("prof", Role::Instructor, "s1");
        registry.register(instructor.clone());

        router.route(inbound(MessageType::Request, None), &instructor).await;

        let history = router.store.get_session_history("s1").await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn direct_request_reaches_only_named_student() {
        let (router, registry) = router();
        let instructor = conn("prof", Role::Instructor, "s1");
        let alice = conn("alice", Role::Student, "s1");
        let bob = conn("bob", Role::Student, "s1");
        registry.register(instructor.clone());
        registry.register(alice.clone());
        registry.register(bob.clone());

        router
            .route(inbound(MessageType::Request, Some("alice")), &instructor)
            .await;

        let history = router.store.get_session_history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_user.as_deref(), Some("alice"));
    }

    /// Regression for the cross-session leak: an instructor handshaking on
    /// one session must not be able to reach a student connected under a
    /// different session by naming their `user_id` in `to_user`, even
    /// though instructors have standing access to every session's roster.
    #[tokio::test]
    async fn direct_request_does_not_cross_into_another_session() {
        let (router, registry) = router();
        let instructor = conn("prof", Role::Instructor, "s1");
        let bob_in_other_session = conn("bob", Role::Student, "s2");
        registry.register(instructor.clone());
        registry.register(bob_in_other_session.clone());

        router
            .route(inbound(MessageType::Request, Some("bob")), &instructor)
            .await;

        // Persists regardless of recipients, but resolves none: `bob` is
        // not on s1's student roster.
        let history = router.store.get_session_history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        let recipients = router.recipients_for("s1", MessageType::Request, Some("bob"));
        assert!(recipients.is_empty());
    }

    #[tokio::test]
    async fn broadcast_with_no_recipients_still_persists() {
        let (router, registry) = router();
        let instructor = conn("prof", Role::Instructor, "s1");
        registry.register(instructor.clone());

        router
            .route(inbound(MessageType::InstructorBroadcast, None), &instructor)
            .await;

        let history = router.store.get_session_history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
