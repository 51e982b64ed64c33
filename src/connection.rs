//! Per-participant duplex channel abstraction.
//!
//! Every other component writes to a connection through [`Connection::write_frame`],
//! which only ever enqueues — the dedicated writer task owns the actual
//! socket half and is the sole place a write can block or fail against the
//! wire, enforcing one writer per socket.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use futures_util::SinkExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::error::ConnectionError;
use crate::types::Role;

/// Fallback outbound queue capacity for call sites (mostly tests) that
/// use [`Connection::spawn`] without an explicit `websocket.buffer_size`.
/// Production call sites use [`Connection::spawn_with_config`].
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 100;
/// Fallback per-write deadline; see `DEFAULT_OUTBOUND_QUEUE_CAPACITY`.
const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(5);

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Default)]
struct Credentials {
    user_id: Option<String>,
    role: Option<Role>,
    session_id: Option<String>,
}

/// A single participant's connection. Cheap to clone (an `Arc` internally
/// via its callers holding `Arc<Connection>`); `write_frame` is the only
/// method most of the server ever calls on one.
pub struct Connection {
    outbound_tx: mpsc::Sender<WsMessage>,
    state: AtomicU8,
    credentials: RwLock<Credentials>,
}

impl Connection {
    /// Spawns the writer task over `sink` and returns the handle other
    /// components hold. The writer task exits when the outbound channel is
    /// closed (via `close()`) or the sink errors. Uses the spec's stated
    /// defaults for outbound queue capacity and write deadline; production
    /// call sites that have a loaded `AppConfig` should prefer
    /// [`Connection::spawn_with_config`].
    pub fn spawn<S>(sink: S) -> std::sync::Arc<Self>
    where
        S: futures_util::Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: std::fmt::Display + Send,
    {
        Self::spawn_with_config(sink, DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_WRITE_DEADLINE)
    }

    /// Spawns the writer task over `sink` with an explicit outbound queue
    /// capacity (`websocket.buffer_size`) and per-write deadline
    /// (`websocket.write_timeout`).
    pub fn spawn_with_config<S>(
        mut sink: S,
        buffer_size: usize,
        write_deadline: Duration,
    ) -> std::sync::Arc<Self>
    where
        S: futures_util::Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: std::fmt::Display + Send,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(buffer_size);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match timeout(write_deadline, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "connection write failed, stopping writer");
                        break;
                    }
                    Err(_) => {
                        warn!("connection write deadline exceeded, stopping writer");
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        std::sync::Arc::new(Self {
            outbound_tx,
            state: AtomicU8::new(STATE_OPEN),
            credentials: RwLock::new(Credentials::default()),
        })
    }

    /// Serializes `v` and enqueues it onto the outbound writer queue.
    /// Non-blocking: fails immediately with `Backpressure` if the queue is
    /// full, `Closed` if the connection has begun closing.
    pub fn write_frame<T: Serialize>(&self, v: &T) -> Result<(), ConnectionError> {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(ConnectionError::Closed);
        }
        let text = serde_json::to_string(v).map_err(|_| ConnectionError::Closed)?;
        self.outbound_tx
            .try_send(WsMessage::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Enqueues a transport-level ping frame, bypassing JSON
    /// serialization. Used by the upgrade handler's heartbeat loop;
    /// unlike `write_frame` this never represents a `system` JSON
    /// message.
    pub fn send_ping(&self) -> Result<(), ConnectionError> {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(ConnectionError::Closed);
        }
        self.outbound_tx
            .try_send(WsMessage::Ping(Vec::new()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Idempotent. Transitions `open`/`closing` to `closed`, dropping the
    /// sender half so the writer task drains and exits.
    pub fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        // Closing the channel: further sends observe `Closed` immediately
        // because `state` is already flipped, regardless of whether the
        // writer task has finished draining.
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Sets this connection's identity, valid only once while `open`.
    pub fn set_credentials(
        &self,
        user_id: String,
        role: Role,
        session_id: String,
    ) -> Result<(), ConnectionError> {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Err(ConnectionError::Closed);
        }
        let mut creds = self.credentials.write();
        if creds.user_id.is_some() {
            return Err(ConnectionError::AlreadySet);
        }
        creds.user_id = Some(user_id);
        creds.role = Some(role);
        creds.session_id = Some(session_id);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().user_id.is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.credentials.read().user_id.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.credentials.read().role
    }

    pub fn session_id(&self) -> Option<String> {
        self.credentials.read().session_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tmpsc;

    /// A `Sink` over a plain channel, standing in for a websocket split
    /// sink in tests that don't need a real socket.
    struct ChannelSink(tmpsc::Sender<WsMessage>);

    impl futures_util::Sink<WsMessage> for ChannelSink {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
            let _ = self.0.try_send(item);
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

    #[tokio::test]
    async fn write_frame_then_close_rejects_further_writes() {
        let (tx, mut rx) = tmpsc::channel(10);
        let conn = Connection::spawn(ChannelSink(tx));

        conn.write_frame(&serde_json::json!({"hello": "world"})).unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, WsMessage::Text(_)));

        conn.close();
        conn.close(); // idempotent
        assert!(conn.is_closed());
        assert!(matches!(
            conn.write_frame(&serde_json::json!({})).unwrap_err(),
            ConnectionError::Closed
        ));
    }

    #[tokio::test]
    async fn set_credentials_once_then_rejects() {
        let (tx, _rx) = tmpsc::channel(10);
        let conn = Connection::spawn(ChannelSink(tx));

        assert!(!conn.is_authenticated());
        conn.set_credentials("alice".into(), Role::Student, "s1".into())
            .unwrap();
        assert!(conn.is_authenticated());
        assert_eq!(conn.user_id().as_deref(), Some("alice"));

        assert!(matches!(
            conn.set_credentials("bob".into(), Role::Student, "s1".into())
                .unwrap_err(),
            ConnectionError::AlreadySet
        ));
    }
}
