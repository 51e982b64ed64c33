//! Session/message schema, the message-type enumeration, and the format
//! predicates every inbound identifier and context string is checked
//! against before it reaches any other component.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum serialized size of a [`Content`] payload.
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

const ID_CHARSET_MIN: usize = 1;
const ID_CHARSET_MAX: usize = 50;
const CONTEXT_MIN: usize = 1;
const CONTEXT_MAX: usize = 50;
const SESSION_NAME_MIN: usize = 1;
const SESSION_NAME_MAX: usize = 200;

const DEFAULT_CONTEXT: &str = "general";

/// `true` iff `s` is 1-50 characters drawn from `[A-Za-z0-9_-]`.
///
/// Used for both user IDs and session IDs: the two share a character class
/// and length bound in this system.
pub fn is_valid_identifier(s: &str) -> bool {
    let len = s.chars().count();
    (ID_CHARSET_MIN..=ID_CHARSET_MAX).contains(&len)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `true` iff `s` is a well-formed message context: 1-50 characters from
/// the same character class as an identifier.
pub fn is_valid_context(s: &str) -> bool {
    let len = s.chars().count();
    (CONTEXT_MIN..=CONTEXT_MAX).contains(&len)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `true` iff `name` is a well-formed session name: 1-200 characters.
pub fn is_valid_session_name(name: &str) -> bool {
    (SESSION_NAME_MIN..=SESSION_NAME_MAX).contains(&name.chars().count())
}

/// Normalizes a client-supplied context: empty or absent becomes
/// `"general"`.
pub fn normalize_context(context: &str) -> String {
    if context.is_empty() {
        DEFAULT_CONTEXT.to_string()
    } else {
        context.to_string()
    }
}

/// A participant's role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Instructor,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Instructor => write!(f, "instructor"),
            Role::Student => write!(f, "student"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instructor" => Ok(Role::Instructor),
            "student" => Ok(Role::Student),
            _ => Err(()),
        }
    }
}

/// The six client-sendable message types, plus `System` for server-
/// originated frames that no client may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    InstructorInbox,
    RequestResponse,
    Analytics,
    InboxResponse,
    Request,
    InstructorBroadcast,
    System,
}

impl MessageType {
    /// `true` for the three types `client_sendable` recognizes as ever
    /// arriving over the wire from a participant, i.e. everything except
    /// `System`.
    pub fn is_client_sendable(self) -> bool {
        self != MessageType::System
    }

    /// The role allowed to send this type, or `None` for `System` (server
    /// only).
    pub fn sender_role(self) -> Option<Role> {
        match self {
            MessageType::InstructorInbox
            | MessageType::RequestResponse
            | MessageType::Analytics => Some(Role::Student),
            MessageType::InboxResponse | MessageType::Request | MessageType::InstructorBroadcast => {
                Some(Role::Instructor)
            }
            MessageType::System => None,
        }
    }

    /// `true` if this message type requires a `to_user` target.
    pub fn requires_to_user(self) -> bool {
        matches!(self, MessageType::InboxResponse | MessageType::Request)
    }

    /// `true` if this message type forbids a `to_user` target.
    pub fn forbids_to_user(self) -> bool {
        matches!(
            self,
            MessageType::InstructorInbox
                | MessageType::RequestResponse
                | MessageType::Analytics
                | MessageType::InstructorBroadcast
        )
    }
}

/// An arbitrary structured payload. Wrapped rather than passed as a bare
/// [`serde_json::Value`] so every component shares one place to measure and
/// serialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(pub serde_json::Value);

impl Content {
    /// The JSON-encoded byte representation of this payload.
    pub fn as_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// The size, in bytes, of the serialized payload.
    pub fn size(&self) -> Result<usize, serde_json::Error> {
        Ok(self.as_bytes()?.len())
    }

    /// `true` if this payload serializes to no more than
    /// [`MAX_CONTENT_BYTES`].
    pub fn within_size_limit(&self) -> Result<bool, serde_json::Error> {
        Ok(self.size()? <= MAX_CONTENT_BYTES)
    }
}

/// A session's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// A bounded messaging context with a roster of students and one or more
/// instructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub student_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

impl Session {
    /// Builds a new active session, generating its ID, deduplicating
    /// `student_ids` while preserving first-seen order.
    pub fn new(name: String, created_by: String, student_ids: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = student_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_by,
            student_ids: deduped,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Transitions this session to `ended`, setting `end_time` to now.
    pub fn end(&mut self) {
        self.status = SessionStatus::Ended;
        self.end_time = Some(Utc::now());
    }
}

/// An append-only, persisted-exactly-once chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub context: String,
    pub from_user: String,
    pub to_user: Option<String>,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
}

/// The fields a client may legally submit in an inbound frame. Anything
/// else (`id`, `from_user`, `session_id`, `timestamp`) is server-assigned
/// and discarded on ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub context: String,
    pub content: Content,
    #[serde(default)]
    pub to_user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_format() {
        assert!(is_valid_identifier("alice-01"));
        assert!(is_valid_identifier("a"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(51)));
        assert!(!is_valid_identifier("alice smith"));
        assert!(!is_valid_identifier("alice@school"));
    }

    #[test]
    fn context_normalization() {
        assert_eq!(normalize_context(""), "general");
        assert_eq!(normalize_context("lab3"), "lab3");
    }

    #[test]
    fn session_dedupes_students_preserving_order() {
        let s = Session::new(
            "Biology 101".to_string(),
            "prof-x".to_string(),
            vec!["a".into(), "b".into(), "a".into(), "c".into()],
        );
        assert_eq!(s.student_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn end_sets_status_and_end_time() {
        let mut s = Session::new("S".to_string(), "t".to_string(), vec!["a".into()]);
        assert!(s.is_active());
        assert!(s.end_time.is_none());
        s.end();
        assert_eq!(s.status, SessionStatus::Ended);
        assert!(s.end_time.is_some());
    }

    #[test]
    fn message_type_permissions() {
        assert_eq!(MessageType::InstructorInbox.sender_role(), Some(Role::Student));
        assert_eq!(MessageType::Request.sender_role(), Some(Role::Instructor));
        assert_eq!(MessageType::System.sender_role(), None);
        assert!(MessageType::Request.requires_to_user());
        assert!(MessageType::InstructorBroadcast.forbids_to_user());
    }

    #[test]
    fn content_size_limit() {
        let small = Content(serde_json::json!({"text": "hi"}));
        assert!(small.within_size_limit().unwrap());

        let big = Content(serde_json::json!({"text": "x".repeat(MAX_CONTENT_BYTES + 1)}));
        assert!(!big.within_size_limit().unwrap());
    }
}
