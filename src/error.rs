//! Error types for shell-relay.

use thiserror::Error;

use crate::session::SessionStatus;

/// Main error type for shell-relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No adapter is registered for the requested session kind.
    #[error("unknown session kind: {0}")]
    UnknownKind(String),

    /// Configuration problem detected at runtime (e.g. a malformed kind).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Event appended for a session that does not exist.
    #[error("referential integrity violation: session {0} does not exist")]
    Referential(String),

    /// Duplicate session id or duplicate (session, seq) pair.
    #[error("uniqueness violation: {0}")]
    Uniqueness(String),

    /// Operation requires a running session.
    #[error("session {id} is not running (status: {status})")]
    NotRunning { id: String, status: SessionStatus },

    /// Adapter failed to start its underlying process.
    #[error("session start failed: {0}")]
    Start(String),

    /// Session with the given ID was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Malformed session identifier.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Invalid status transition attempted.
    #[error("invalid status transition from {from} to {to}")]
    InvalidStateTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Underlying SQLite failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON encoding/decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// PTY-related error.
    #[error("PTY error: {0}")]
    Pty(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Graceful stop exceeded its grace period.
    #[error("operation timed out")]
    Timeout,

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,

    /// A blocking storage task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RelayError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownKind(_) | Self::Configuration(_) => "UNKNOWN_KIND",
            Self::Referential(_) | Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidSessionId(_) => "BAD_REQUEST",
            Self::Uniqueness(_) => "CONFLICT",
            Self::NotRunning { .. } => "NOT_RUNNING",
            Self::Start(_) => "START_FAILED",
            Self::InvalidStateTransition { .. } => "INVALID_TRANSITION",
            Self::Timeout => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether this is one of the integrity errors that indicate an ordering bug.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Referential(_) | Self::Uniqueness(_))
    }
}

/// Convenience Result type for shell-relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_display() {
        let err = RelayError::SessionNotFound("pty_00ff".into());
        assert!(err.to_string().contains("pty_00ff"));
        assert!(err.to_string().contains("not found"));
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn test_not_running_display() {
        let err = RelayError::NotRunning {
            id: "pty_01".into(),
            status: SessionStatus::Stopped,
        };
        assert!(err.to_string().contains("pty_01"));
        assert!(err.to_string().contains("stopped"));
        assert_eq!(err.code(), "NOT_RUNNING");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_integrity_classification() {
        assert!(RelayError::Referential("x".into()).is_integrity());
        assert!(RelayError::Uniqueness("x".into()).is_integrity());
        assert!(!RelayError::Timeout.is_integrity());
        assert!(!RelayError::UnknownKind("bogus".into()).is_integrity());
    }

    #[test]
    fn test_unknown_kind_code() {
        let err = RelayError::UnknownKind("bogus-kind".into());
        assert_eq!(err.code(), "UNKNOWN_KIND");
        assert!(err.to_string().contains("bogus-kind"));
    }
}
