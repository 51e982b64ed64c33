//! O(1) recipient lookup by `(session_id, role)` and by `user_id`. Three
//! maps guarded by independent `parking_lot::RwLock`s so reads (recipient
//! computation in the Router) run concurrently while the Hub's single
//! task serializes mutations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::types::Role;

#[derive(Default)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub instructor_connections: usize,
    pub student_connections: usize,
    pub sessions_with_connections: usize,
}

#[derive(Default)]
pub struct Registry {
    global: RwLock<HashMap<String, Arc<Connection>>>,
    instructors: RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>,
    students: RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn`, which must already be authenticated. Evicts and
    /// closes any existing connection for the same `user_id` first
    /// (silent replacement).
    pub fn register(&self, conn: Arc<Connection>) {
        debug_assert!(conn.is_authenticated());
        let Some(user_id) = conn.user_id() else { return };
        let Some(role) = conn.role() else { return };
        let Some(session_id) = conn.session_id() else { return };

        self.force_remove(&user_id);

        self.global.write().insert(user_id.clone(), conn.clone());
        let role_map = match role {
            Role::Instructor => &self.instructors,
            Role::Student => &self.students,
        };
        role_map
            .write()
            .entry(session_id)
            .or_default()
            .insert(user_id, conn);
    }

    /// Removes `user_id` from all maps unconditionally, closing whatever
    /// connection is currently registered under it, if any. Only called
    /// from `register`'s own eviction step, where the caller already
    /// knows it is about to replace that slot — anywhere else this would
    /// let a connection's own stale teardown evict whatever has since
    /// replaced it (see `unregister`).
    fn force_remove(&self, user_id: &str) {
        let removed = self.global.write().remove(user_id);
        let Some(conn) = removed else { return };
        if let Some(session_id) = conn.session_id() {
            self.instructors
                .write()
                .get_mut(&session_id)
                .map(|m| m.remove(user_id));
            self.students
                .write()
                .get_mut(&session_id)
                .map(|m| m.remove(user_id));
        }
        conn.close();
    }

    /// Removes `conn` from all maps and closes it — but only if `conn` is
    /// still the connection currently registered for its `user_id`.
    ///
    /// A connection's teardown path (idle timeout, read error, client
    /// close) calls this with its own handle. If a duplicate upgrade for
    /// the same `user_id` has since registered and evicted this one
    /// (§4.7 "silent replacement"), `conn` no longer occupies its old
    /// slot — the slot holds the new connection instead — and this is a
    /// no-op: the departing connection must never evict its replacement.
    /// Idempotent: calling this again with the same already-evicted
    /// `conn` stays a no-op.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        let Some(user_id) = conn.user_id() else { return };

        let still_current = {
            let mut global = self.global.write();
            match global.get(&user_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    global.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        if !still_current {
            return;
        }

        if let Some(session_id) = conn.session_id() {
            let role_map = match conn.role() {
                Some(Role::Instructor) => &self.instructors,
                Some(Role::Student) => &self.students,
                None => {
                    conn.close();
                    return;
                }
            };
            if let Some(m) = role_map.write().get_mut(&session_id) {
                if m.get(&user_id).is_some_and(|existing| Arc::ptr_eq(existing, conn)) {
                    m.remove(&user_id);
                }
            }
        }
        conn.close();
    }

    pub fn get_user_connection(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.global.read().get(user_id).cloned()
    }

    /// Every connection currently registered, regardless of session or
    /// role. Used by shutdown to close all connections with a normal
    /// closure.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.global.read().values().cloned().collect()
    }

    pub fn get_session_instructors(&self, session_id: &str) -> Vec<Arc<Connection>> {
        self.instructors
            .read()
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_session_students(&self, session_id: &str) -> Vec<Arc<Connection>> {
        self.students
            .read()
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_session_connections(&self, session_id: &str) -> Vec<Arc<Connection>> {
        let mut conns = self.get_session_instructors(session_id);
        conns.extend(self.get_session_students(session_id));
        conns
    }

    pub fn stats(&self) -> RegistryStats {
        let instructors = self.instructors.read();
        let students = self.students.read();
        let instructor_connections: usize = instructors.values().map(|m| m.len()).sum();
        let student_connections: usize = students.values().map(|m| m.len()).sum();
        let sessions: std::collections::HashSet<&String> =
            instructors.keys().chain(students.keys()).collect();

        RegistryStats {
            total_connections: self.global.read().len(),
            instructor_connections,
            student_connections,
            sessions_with_connections: sessions.len(),
        }
    }
}
