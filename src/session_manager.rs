//! The active-session cache and membership authority.
//!
//! Sessions live in a `parking_lot::RwLock`-guarded map while active, backed
//! by the [`Store`] for durability and for history lookups past process
//! restart. The cache only ever holds active sessions; ending a session
//! removes it from the cache after the `Store` write succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::instrument;

use crate::error::SessionError;
use crate::storage::Store;
use crate::types::{is_valid_identifier, is_valid_session_name, Role, Session};

pub struct SessionManager {
    store: Arc<dyn Store>,
    active: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Loads all sessions the store considers active into the in-memory
    /// cache. Call once at startup, before accepting connections.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self, SessionError> {
        let sessions = store.list_active_sessions().await?;
        let active = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(Self {
            store,
            active: RwLock::new(active),
        })
    }

    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        name: String,
        created_by: String,
        student_ids: Vec<String>,
    ) -> Result<Session, SessionError> {
        if !is_valid_session_name(&name) {
            return Err(SessionError::InvalidName);
        }
        if student_ids.is_empty() {
            return Err(SessionError::EmptyStudentList);
        }
        if !is_valid_identifier(&created_by) {
            return Err(SessionError::InvalidUserId(created_by));
        }
        for id in &student_ids {
            if !is_valid_identifier(id) {
                return Err(SessionError::InvalidUserId(id.clone()));
            }
        }

        let session = Session::new(name, created_by, student_ids);
        self.store.create_session(&session).await?;
        self.active.write().insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.active
            .read()
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.active.read().values().cloned().collect()
    }

    pub fn is_session_active(&self, id: &str) -> bool {
        self.active.read().contains_key(id)
    }

    /// Ends a session: persists the `ended` status and drops it from the
    /// cache. Returns the session as it stood immediately before ending, so
    /// callers (the hub's shutdown broadcast) can still read its roster.
    ///
    /// The cache holds only active sessions, so a cache miss is ambiguous
    /// between "never existed" and "already ended" — on miss this falls
    /// back to the store to tell those two apart and report the correct
    /// error kind.
    #[instrument(skip(self))]
    pub async fn end_session(&self, id: &str) -> Result<Session, SessionError> {
        let mut session = match self.get_session(id) {
            Ok(session) => session,
            Err(SessionError::NotFound) => match self.store.get_session(id).await {
                Ok(persisted) if !persisted.is_active() => return Err(SessionError::AlreadyEnded),
                Ok(persisted) => persisted,
                Err(crate::error::StoreError::NotFound) => return Err(SessionError::NotFound),
                Err(e) => return Err(SessionError::Store(e)),
            },
            Err(e) => return Err(e),
        };
        session.end();
        self.store.update_session(&session).await?;
        self.active.write().remove(id);
        Ok(session)
    }

    /// Validates that `user_id` holding `role` belongs to session `id`,
    /// returning the session on success. Instructors are admitted
    /// unconditionally to any active session — classrooms in this system
    /// assume instructors roam across sessions, so authorization for that
    /// role rests entirely on the session being active, not on roster
    /// membership. Students must appear in `student_ids`.
    pub fn validate_membership(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<Session, SessionError> {
        let session = self.get_session(session_id)?;
        let belongs = match role {
            Role::Instructor => true,
            Role::Student => session.student_ids.iter().any(|s| s == user_id),
        };
        if !belongs {
            return Err(SessionError::NotEnrolled);
        }
        Ok(session)
    }
}
