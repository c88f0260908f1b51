//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub(crate) fn session_not_found(upload_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("upload session {upload_id}"))
    }
}

impl From<porter_core::Error> for MetadataError {
    fn from(err: porter_core::Error) -> Self {
        match err {
            porter_core::Error::InvalidTransition { from, to } => {
                Self::InvalidStateTransition { from, to }
            }
            other => Self::Corrupt(other.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_transition_error_maps_to_state_transition() {
        let err: MetadataError = porter_core::Error::InvalidTransition {
            from: "completed".to_string(),
            to: "pending".to_string(),
        }
        .into();
        assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));
        assert_eq!(err.to_string(), "invalid state transition: completed -> pending");
    }

    #[test]
    fn test_other_core_errors_are_corruption() {
        let err: MetadataError = porter_core::Error::InvalidStatus("open".to_string()).into();
        assert!(matches!(err, MetadataError::Corrupt(_)));
    }
}
