//! Durable storage for sessions and messages.
//!
//! Expressed as a trait so the rest of the server depends on behavior, not
//! on SQLite specifically. `SqliteStore` is the production implementation;
//! `MemoryStore` is an in-process test double used where a test needs a
//! `Store` without touching disk.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::{Message, Session};

/// Durable storage for sessions and messages, and a health probe.
///
/// Implementations must persist each `store_message` call exactly once and
/// must serialize writes so that "persist-then-route" holds: once a
/// write completes, it is immediately visible to a
/// concurrent `get_session_history` call.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &str) -> Result<Session, StoreError>;
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn list_active_sessions(&self) -> Result<Vec<Session>, StoreError>;
    /// `message.id` must already be set by the caller (the Router); the
    /// store never generates one.
    async fn store_message(&self, message: &Message) -> Result<(), StoreError>;
    /// Ordered by `timestamp` ascending, then `id` as tiebreaker.
    async fn get_session_history(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}
