//! Typed failures of the upload session operations.

use porter_core::UploadStatus;
use porter_metadata::MetadataError;
use porter_storage::StorageError;
use thiserror::Error;

/// Errors returned by admission, the offset protocol and completion.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload {0} belongs to another owner")]
    Forbidden(String),

    #[error("cannot {operation} an upload that is {status}")]
    InvalidState {
        status: UploadStatus,
        operation: &'static str,
    },

    #[error("offset mismatch: upload is at {expected}, chunk starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("chunk of {len} bytes at offset {offset} exceeds declared size {total_size}")]
    ChunkOutOfBounds {
        offset: u64,
        len: u64,
        total_size: u64,
    },

    #[error("upload expired")]
    Expired,

    #[error("no upload slot available ({active} active, limit {max_concurrent})")]
    QueueFull { active: u64, max_concurrent: u32 },

    #[error("storage write failed: {0}")]
    StorageWriteFailure(#[source] StorageError),

    #[error("resource link failed: {0}")]
    ResourceLinkFailure(String),

    #[error("resource rejected the upload: {0}")]
    ResourceRejected(String),

    #[error("completion already in progress")]
    LinkInProgress,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    /// Stable label used for metrics and error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidState { .. } => "invalid_state",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::ChunkOutOfBounds { .. } => "chunk_out_of_bounds",
            Self::Expired => "upload_expired",
            Self::QueueFull { .. } => "queue_full",
            Self::StorageWriteFailure(_) => "storage_write_failure",
            Self::ResourceLinkFailure(_) => "resource_link_failure",
            Self::ResourceRejected(_) => "resource_rejected",
            Self::LinkInProgress => "link_in_progress",
            Self::Invalid(_) => "invalid_request",
            Self::Metadata(_) => "metadata_error",
            Self::Storage(_) => "storage_error",
        }
    }

    pub(crate) fn invalid_state(status: UploadStatus, operation: &'static str) -> Self {
        Self::InvalidState { status, operation }
    }
}

impl From<MetadataError> for UploadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => Self::NotFound(what),
            other => Self::Metadata(other),
        }
    }
}

impl From<porter_core::Error> for UploadError {
    fn from(err: porter_core::Error) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Result type for upload session operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;
