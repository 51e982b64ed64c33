//! Decouples ingress I/O from routing and registry mutation. One
//! draining task owns the Router and the Registry's write path; every
//! inbound frame and every connection join/leave flows through its
//! intake queue so the two stay ordered with respect to each other — a
//! single serialization point backed by a bounded channel into one task
//! that owns the mutable state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::registry::Registry;
use crate::router::Router;
use crate::types::InboundMessage;

const INTAKE_QUEUE_CAPACITY: usize = 1000;
const STOP_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

enum Event {
    Message(InboundMessage, Arc<Connection>),
    Register(Arc<Connection>),
    /// Carries the departing connection itself, not just its `user_id` —
    /// the Registry only evicts an entry when this is still the current
    /// occupant of that `user_id`'s slot, so a connection's own stale
    /// teardown can never evict whatever has since replaced it.
    Unregister(Arc<Connection>),
}

/// Handle held by every other component. Cloning is cheap — it is just
/// the intake sender plus a shared `Router`/`Registry` reference used for
/// synchronous, read-only lookups (health stats) that don't need to go
/// through the serialized event stream.
#[derive(Clone)]
pub struct Hub {
    intake_tx: mpsc::Sender<Event>,
    registry: Arc<Registry>,
    router: Arc<Router>,
}

impl Hub {
    /// Spawns the draining task and returns the handle. `router` and
    /// `registry` are shared with the caller so HTTP handlers can read
    /// registry stats and emit session-ended frames without going
    /// through the intake queue (those have no ordering requirement
    /// against message routing).
    pub fn start(router: Arc<Router>, registry: Arc<Registry>) -> (Self, JoinHandle<()>) {
        let (intake_tx, mut intake_rx) = mpsc::channel(INTAKE_QUEUE_CAPACITY);

        let task_router = router.clone();
        let task_registry = registry.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = intake_rx.recv().await {
                match event {
                    Event::Message(inbound, sender) => {
                        task_router.route(inbound, &sender).await;
                    }
                    Event::Register(conn) => {
                        task_registry.register(conn);
                    }
                    Event::Unregister(conn) => {
                        task_registry.unregister(&conn);
                    }
                }
            }
            info!("hub intake queue closed, drain task exiting");
        });

        (
            Self {
                intake_tx,
                registry,
                router,
            },
            handle,
        )
    }

    /// Enqueues an inbound message for routing. Non-blocking: returns
    /// `false` (`HubFull` to the caller) if the intake queue is
    /// saturated.
    pub fn send_message(&self, message: InboundMessage, sender: Arc<Connection>) -> bool {
        match self.intake_tx.try_send(Event::Message(message, sender)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("hub intake queue full, rejecting message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueues registration so it serializes with message handling —
    /// "connection joined" always precedes any send the hub processes
    /// for it afterward.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        self.intake_tx.try_send(Event::Register(conn)).is_ok()
    }

    /// Enqueues `conn`'s own departure. Only evicts the Registry slot for
    /// `conn.user_id()` if `conn` is still the connection registered
    /// there — see `Event::Unregister`.
    pub fn unregister(&self, conn: Arc<Connection>) -> bool {
        self.intake_tx.try_send(Event::Unregister(conn)).is_ok()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Closes the intake queue and waits (bounded) for the drain task to
    /// finish processing whatever was already enqueued.
    pub async fn stop(self, handle: JoinHandle<()>) {
        drop(self.intake_tx);
        if tokio::time::timeout(STOP_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("hub drain task did not finish within shutdown deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{Content, MessageType, Role};
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

    fn hub() -> (Hub, JoinHandle<()>) {
        let registry = Arc::new(Registry::new());
        let router = Arc::new(Router::new(Arc::new(MemoryStore::new()), registry.clone()));
        Hub::start(router, registry)
    }

    #[tokio::test]
    async fn register_then_message_is_processed_in_order() {
        let (hub, handle) = hub();
        let instructor = conn("prof", Role::Instructor, "s1");
        let student = conn("alice", Role::Student, "s1");

        assert!(hub.register(instructor));
        assert!(hub.register(student.clone()));
        assert!(hub.send_message(
            InboundMessage {
                message_type: MessageType::InstructorInbox,
                context: String::new(),
                content: Content(serde_json::json!({"text": "hi"})),
                to_user: None,
            },
            student,
        ));

        // Give the drain task a chance to process both events.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hub.registry().get_session_connections("s1").len(), 2);

        hub.stop(handle).await;
    }

    #[tokio::test]
    async fn stop_drains_then_exits() {
        let (hub, handle) = hub();
        assert!(hub.register(conn("alice", Role::Student, "s1")));
        hub.stop(handle).await;
    }

    /// A duplicate upgrade registers a second connection for the same
    /// `user_id`, evicting the first. If the first connection's own
    /// teardown is still in flight and reaches the hub afterward, it
    /// must not unregister the replacement — mirrors spec.md §8's
    /// "leaves exactly one active" duplicate-registration property
    /// through the same event-ordered path production traffic uses.
    #[tokio::test]
    async fn stale_unregister_after_duplicate_registration_spares_replacement() {
        let (hub, handle) = hub();
        let first = conn("alice", Role::Student, "s1");
        let second = conn("alice", Role::Student, "s1");

        assert!(hub.register(first.clone()));
        assert!(hub.register(second.clone()));
        // `first`'s reader loop observes its own closed sink and enqueues
        // its own teardown after the fact.
        assert!(hub.unregister(first));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let current = hub.registry().get_user_connection("alice");
        assert!(current.is_some());
        assert!(Arc::ptr_eq(&current.unwrap(), &second));

        hub.stop(handle).await;
    }
}
