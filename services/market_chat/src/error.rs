use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("user is not a participant of this conversation")]
    NotParticipant,

    #[error("only the author may change this message")]
    NotAuthor,

    #[error("edit window expired (max_edit_minutes: {max_edit_minutes})")]
    EditWindowExpired { max_edit_minutes: i64 },

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("attachment of {size} bytes exceeds the {limit} byte limit")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("not found")]
    NotFound,

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("store unavailable: {0}")]
    Store(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl ChatError {
    /// Stable machine-readable code shared by HTTP bodies and socket notices.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotParticipant => "not_participant",
            ChatError::NotAuthor => "not_author",
            ChatError::EditWindowExpired { .. } => "edit_window_expired",
            ChatError::Invalid(_) => "invalid_message",
            ChatError::SizeExceeded { .. } => "size_exceeded",
            ChatError::NotFound => "not_found",
            ChatError::Unauthorized => "unauthorized",
            ChatError::Upload(_) => "upload_failed",
            ChatError::Store(_) => "store_unavailable",
            ChatError::Subscription(_) => "subscription_failed",
        }
    }

    /// Transient I/O failures the caller may retry. Nothing is retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Upload(_) | ChatError::Store(_) | ChatError::Subscription(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::NotParticipant
            | ChatError::NotAuthor
            | ChatError::EditWindowExpired { .. } => StatusCode::FORBIDDEN,
            ChatError::Invalid(_) => StatusCode::BAD_REQUEST,
            ChatError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Upload(_) => StatusCode::BAD_GATEWAY,
            ChatError::Store(_) | ChatError::Subscription(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(e: r2d2::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::Store(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResp {
    error: &'static str,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if self.is_retryable() {
            tracing::warn!(error = %self, "request failed");
        }
        (
            self.status_code(),
            Json(ErrorResp { error: self.code() }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rules_are_not_retryable() {
        assert!(!ChatError::NotAuthor.is_retryable());
        assert!(!ChatError::EditWindowExpired { max_edit_minutes: 5 }.is_retryable());
        assert!(ChatError::Store("io".into()).is_retryable());
        assert_eq!(
            ChatError::SizeExceeded { size: 2, limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
