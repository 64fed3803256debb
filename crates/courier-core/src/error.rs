//! Error types for courier.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using courier's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for courier operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An event with the same (event_type, idempotency_key) was already emitted.
    #[error("Duplicate event: {event_type} with idempotency key {idempotency_key} already emitted")]
    DuplicateEvent {
        event_type: String,
        idempotency_key: String,
    },

    /// A part with the same number was already recorded for the session.
    #[error("Duplicate part: part {part_number} already recorded for session {session_id}")]
    DuplicatePart { session_id: Uuid, part_number: i32 },

    /// Session completion requested before every part arrived.
    #[error("Incomplete upload: cannot complete session {session_id}: received {received} of {expected} parts")]
    IncompleteUpload {
        session_id: Uuid,
        received: i64,
        expected: i32,
    },

    /// Conditional state transition found the record in an unexpected state.
    #[error("Invalid transition: {entity} {id} is not {expected}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        expected: String,
    },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the event was already emitted.
    ///
    /// Callers of the emission API treat this as success-by-prior-write.
    pub fn is_duplicate_event(&self) -> bool {
        matches!(self, Error::DuplicateEvent { .. })
    }

    /// Whether this error signals a caller-side precondition bug.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::IncompleteUpload { .. } | Error::InvalidTransition { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_duplicate_event() {
        let err = Error::DuplicateEvent {
            event_type: "file.stored".to_string(),
            idempotency_key: "UploadFile:42".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate event: file.stored with idempotency key UploadFile:42 already emitted"
        );
        assert!(err.is_duplicate_event());
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_error_display_incomplete_upload_names_shortfall() {
        let id = Uuid::nil();
        let err = Error::IncompleteUpload {
            session_id: id,
            received: 1,
            expected: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("received 1 of 2 parts"));
        assert!(msg.contains(&id.to_string()));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let id = Uuid::nil();
        let err = Error::InvalidTransition {
            entity: "upload_file",
            id,
            expected: "stored".to_string(),
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid transition: upload_file {} is not stored", id)
        );
        assert!(err.is_precondition());
    }

    #[test]
    fn test_error_display_duplicate_part() {
        let err = Error::DuplicatePart {
            session_id: Uuid::nil(),
            part_number: 3,
        };
        assert!(err.to_string().contains("part 3 already recorded"));
    }

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("negative size".to_string());
        assert_eq!(err.to_string(), "Invalid input: negative size");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => {
                assert!(!msg.is_empty());
            }
            _ => panic!("Expected Serialization error"),
        }
    }
}
