//! The error taxonomy, expressed as one small `thiserror` enum per layer
//! rather than a single crate-wide error type, scoping each enum to its
//! own component boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("backpressure: writer queue is full")]
    Backpressure,
    #[error("store is closed")]
    Closed,
    #[error("database unavailable: {0}")]
    DbUnavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::DbUnavailable(e.to_string())
    }
}

/// Errors from the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session name")]
    InvalidName,
    #[error("student list must not be empty")]
    EmptyStudentList,
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
    #[error("session not found")]
    NotFound,
    #[error("session already ended")]
    AlreadyEnded,
    #[error("user is not enrolled in this session")]
    NotEnrolled,
    #[error("unknown role")]
    UnknownRole,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced to a sender as a `system{context:"message_error"}`
/// frame by the Router.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("invalid context")]
    InvalidContext,
    #[error("invalid content")]
    InvalidContent,
    #[error("content too large")]
    ContentTooLarge,
    #[error("to_user is required for this message type")]
    MissingToUser,
    #[error("to_user is not permitted for this message type")]
    UnexpectedToUser,
    #[error("sender role may not send this message type")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("hub intake queue is full")]
    HubFull,
    #[error("persistence error")]
    PersistenceFailed,
}

impl RouterError {
    /// The stable error-kind string placed in a `message_error` frame's
    /// `content.error` field.
    pub fn kind(self) -> &'static str {
        match self {
            RouterError::InvalidMessageType => "InvalidMessageType",
            RouterError::InvalidContext => "InvalidContext",
            RouterError::InvalidContent => "InvalidContent",
            RouterError::ContentTooLarge => "ContentTooLarge",
            RouterError::MissingToUser | RouterError::UnexpectedToUser => "InvalidRequest",
            RouterError::Forbidden => "Forbidden",
            RouterError::RateLimited => "RateLimited",
            RouterError::HubFull => "HubFull",
            RouterError::PersistenceFailed => "DBUnavailable",
        }
    }
}

/// Errors from the connection wrapper.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("outbound queue is full")]
    Backpressure,
    #[error("connection is closed")]
    Closed,
    #[error("credentials already set")]
    AlreadySet,
}

/// Errors surfaced at the HTTP boundary as `{error, code, message}` JSON
/// bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidName
            | SessionError::EmptyStudentList
            | SessionError::InvalidUserId(_)
            | SessionError::AlreadyEnded => ApiError::BadRequest(e.to_string()),
            SessionError::NotFound => ApiError::NotFound(e.to_string()),
            SessionError::NotEnrolled | SessionError::UnknownRole => {
                ApiError::Forbidden(e.to_string())
            }
            SessionError::Store(StoreError::AlreadyExists) => ApiError::BadRequest(e.to_string()),
            SessionError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": code,
            "code": status.as_u16(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_context_and_invalid_content_report_distinct_kinds() {
        assert_eq!(RouterError::InvalidContext.kind(), "InvalidContext");
        assert_eq!(RouterError::InvalidContent.kind(), "InvalidContent");
        assert_eq!(RouterError::InvalidContext.to_string(), "invalid context");
        assert_eq!(RouterError::InvalidContent.to_string(), "invalid content");
    }
}
