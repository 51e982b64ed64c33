//! An in-process [`Store`] backed by `parking_lot`-guarded maps, used in
//! tests that exercise the session manager, router, or hub without paying
//! for disk I/O. Same trait as the SQLite implementation, no persistence
//! guarantees beyond the process lifetime.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::Store;
use crate::error::StoreError;
use crate::types::{Message, Session};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if !sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    async fn store_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .entry(message.session_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_session_history(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, MessageType};

    #[tokio::test]
    async fn create_duplicate_fails() {
        let store = MemoryStore::new();
        let session = Session::new("Bio".into(), "prof".into(), vec!["a".into()]);
        store.create_session(&session).await.unwrap();
        assert!(matches!(
            store.create_session(&session).await.unwrap_err(),
            StoreError::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn history_accumulates_in_insertion_order() {
        let store = MemoryStore::new();
        let session = Session::new("Bio".into(), "prof".into(), vec!["a".into()]);
        store.create_session(&session).await.unwrap();

        for i in 0..3 {
            let message = Message {
                id: format!("m{i}"),
                session_id: session.id.clone(),
                message_type: MessageType::InstructorBroadcast,
                context: "general".into(),
                from_user: "prof".into(),
                to_user: None,
                content: Content(serde_json::json!({"i": i})),
                timestamp: chrono::Utc::now(),
            };
            store.store_message(&message).await.unwrap();
        }

        let history = store.get_session_history(&session.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, "m0");
        assert_eq!(history[2].id, "m2");
    }
}
