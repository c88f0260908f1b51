//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid upload status: {0}")]
    InvalidStatus(String),

    #[error("invalid upload kind: {0}")]
    InvalidKind(String),

    #[error("illegal status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid chunk digest: {0}")]
    InvalidDigest(String),

    #[error("invalid resource id: {0:?}")]
    InvalidResourceId(String),

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
