//! SQLite-backed [`Store`] implementation.
//!
//! A single writer task owns the one read-write connection and drains a
//! bounded command queue; every write operation carries a `oneshot`
//! completion channel and is bounded by `database.timeout`. Reads open
//! their own short-lived read-only
//! connection per call via `spawn_blocking` — cheap under SQLite's WAL
//! mode and proceeds concurrently with the writer. Each read opens its
//! own connection, runs on a blocking thread, and never holds it across
//! an `.await`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use super::Store;
use crate::error::StoreError;
use crate::types::{Content, Message, MessageType, Session, SessionStatus};

const SCHEMA: &str = include_str!("schema.sql");
const WRITER_QUEUE_CAPACITY: usize = 32;

enum WriteOp {
    CreateSession(Box<Session>, oneshot::Sender<Result<(), StoreError>>),
    UpdateSession(Box<Session>, oneshot::Sender<Result<(), StoreError>>),
    StoreMessage(Box<Message>, oneshot::Sender<Result<(), StoreError>>),
}

pub struct SqliteStore {
    path: PathBuf,
    writer_tx: mpsc::Sender<WriteOp>,
    write_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Opens (creating if absent) a SQLite database at `path`, runs the
    /// schema, and spawns the writer task.
    pub fn open(path: impl AsRef<Path>, write_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        spawn_writer(conn, writer_rx);

        Ok(Self {
            path,
            writer_tx,
            write_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn read_connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    async fn submit(&self, op_for: &str, op: WriteOp) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.writer_tx.try_send(op).map_err(|_| {
            warn!(op = op_for, "writer queue saturated");
            StoreError::Backpressure
        })?;
        Ok(())
    }
}

fn spawn_writer(conn: Connection, mut rx: mpsc::Receiver<WriteOp>) {
    tokio::task::spawn_blocking(move || {
        while let Some(op) = rx.blocking_recv() {
            match op {
                WriteOp::CreateSession(session, tx) => {
                    let result = insert_session(&conn, &session);
                    let _ = tx.send(result);
                }
                WriteOp::UpdateSession(session, tx) => {
                    let result = update_session_row(&conn, &session);
                    let _ = tx.send(result);
                }
                WriteOp::StoreMessage(message, tx) => {
                    let result = insert_message(&conn, &message);
                    let _ = tx.send(result);
                }
            }
        }
    });
}

fn insert_session(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let now = Utc::now();
    let student_ids = serde_json::to_string(&session.student_ids)
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?;

    let result = conn.execute(
        "INSERT INTO sessions (id, name, created_by, student_ids, start_time, end_time, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session.id,
            session.name,
            session.created_by,
            student_ids,
            session.start_time.to_rfc3339(),
            session.end_time.map(|t| t.to_rfc3339()),
            status_str(session.status),
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

fn update_session_row(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE sessions SET end_time = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            session.end_time.map(|t| t.to_rfc3339()),
            status_str(session.status),
            Utc::now().to_rfc3339(),
            session.id,
        ],
    )?;

    if rows == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn insert_message(conn: &Connection, message: &Message) -> Result<(), StoreError> {
    let content = message
        .content
        .as_bytes()
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?;

    conn.execute(
        "INSERT INTO messages (id, session_id, type, context, from_user, to_user, content, timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id,
            message.session_id,
            message_type_str(message.message_type),
            message.context,
            message.from_user,
            message.to_user,
            String::from_utf8_lossy(&content).to_string(),
            message.timestamp.to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Ended => "ended",
    }
}

fn status_from_str(s: &str) -> SessionStatus {
    match s {
        "ended" => SessionStatus::Ended,
        _ => SessionStatus::Active,
    }
}

fn message_type_str(t: MessageType) -> &'static str {
    match t {
        MessageType::InstructorInbox => "instructor_inbox",
        MessageType::RequestResponse => "request_response",
        MessageType::Analytics => "analytics",
        MessageType::InboxResponse => "inbox_response",
        MessageType::Request => "request",
        MessageType::InstructorBroadcast => "instructor_broadcast",
        MessageType::System => "system",
    }
}

fn message_type_from_str(s: &str) -> Option<MessageType> {
    Some(match s {
        "instructor_inbox" => MessageType::InstructorInbox,
        "request_response" => MessageType::RequestResponse,
        "analytics" => MessageType::Analytics,
        "inbox_response" => MessageType::InboxResponse,
        "request" => MessageType::Request,
        "instructor_broadcast" => MessageType::InstructorBroadcast,
        "system" => MessageType::System,
        _ => return None,
    })
}

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    let student_ids_json: String = row.get("student_ids")?;
    let student_ids: Vec<String> = serde_json::from_str(&student_ids_json).unwrap_or_default();
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let status: String = row.get("status")?;

    Ok(Session {
        id: row.get("id")?,
        name: row.get("name")?,
        created_by: row.get("created_by")?,
        student_ids,
        start_time: parse_time(&start_time),
        end_time: end_time.as_deref().map(parse_time),
        status: status_from_str(&status),
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let content_str: String = row.get("content")?;
    let content: serde_json::Value =
        serde_json::from_str(&content_str).unwrap_or(serde_json::Value::Null);
    let type_str: String = row.get("type")?;
    let timestamp: String = row.get("timestamp")?;

    Ok(Message {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        message_type: message_type_from_str(&type_str).unwrap_or(MessageType::System),
        context: row.get("context")?,
        from_user: row.get("from_user")?,
        to_user: row.get("to_user")?,
        content: Content(content),
        timestamp: parse_time(&timestamp),
    })
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.submit("create_session", WriteOp::CreateSession(Box::new(session.clone()), tx))
            .await?;
        timeout(self.write_timeout, rx)
            .await
            .map_err(|_| StoreError::DbUnavailable("write timed out".into()))?
            .map_err(|_| StoreError::Closed)?
    }

    async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.read_connection()?;
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], session_from_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                    e => e.into(),
                })
        })
        .await
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.submit("update_session", WriteOp::UpdateSession(Box::new(session.clone()), tx))
            .await?;
        timeout(self.write_timeout, rx)
            .await
            .map_err(|_| StoreError::DbUnavailable("write timed out".into()))?
            .map_err(|_| StoreError::Closed)?
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.read_connection()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn.prepare("SELECT * FROM sessions WHERE status = 'active'")?;
            let rows = stmt.query_map([], session_from_row)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
        .await
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?
    }

    async fn store_message(&self, message: &Message) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.submit("store_message", WriteOp::StoreMessage(Box::new(message.clone()), tx))
            .await?;
        timeout(self.write_timeout, rx)
            .await
            .map_err(|_| StoreError::DbUnavailable("write timed out".into()))?
            .map_err(|_| StoreError::Closed)?
    }

    async fn get_session_history(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.read_connection()?;
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], message_from_row)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let conn = self.read_connection()?;
        tokio::task::spawn_blocking(move || {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::DbUnavailable(e.to_string()))?
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the sender lets the writer task drain remaining
        // commands and exit; we don't block on it here since `close()`
        // callers (the shutdown path) already impose their own deadline.
        warn!("closing sqlite store at {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.sqlite3"), Duration::from_secs(5)).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (store, _dir) = store();
        let session = Session::new("Bio".into(), "prof".into(), vec!["a".into(), "b".into()]);
        store.create_session(&session).await.unwrap();

        let fetched = store.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.student_ids, session.student_ids);
        assert!(fetched.is_active());
    }

    #[tokio::test]
    async fn duplicate_create_fails_already_exists() {
        let (store, _dir) = store();
        let session = Session::new("Bio".into(), "prof".into(), vec!["a".into()]);
        store.create_session(&session).await.unwrap();

        let err = store.create_session(&session).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let (store, _dir) = store();
        let err = store.get_session("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn update_then_list_active_excludes_ended() {
        let (store, _dir) = store();
        let mut session = Session::new("Bio".into(), "prof".into(), vec!["a".into()]);
        store.create_session(&session).await.unwrap();

        let active = store.list_active_sessions().await.unwrap();
        assert_eq!(active.len(), 1);

        session.end();
        store.update_session(&session).await.unwrap();

        let active = store.list_active_sessions().await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn store_message_then_history_round_trips() {
        let (store, _dir) = store();
        let session = Session::new("Bio".into(), "prof".into(), vec!["a".into()]);
        store.create_session(&session).await.unwrap();

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            message_type: MessageType::InstructorBroadcast,
            context: "general".into(),
            from_user: "prof".into(),
            to_user: None,
            content: Content(serde_json::json!({"text": "hi"})),
            timestamp: Utc::now(),
        };
        store.store_message(&message).await.unwrap();

        let history = store.get_session_history(&session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, message.id);
        assert_eq!(history[0].content, message.content);
        let _ = Role::Instructor;
    }

    #[tokio::test]
    async fn health_check_succeeds_on_open_store() {
        let (store, _dir) = store();
        store.health_check().await.unwrap();
    }
}
