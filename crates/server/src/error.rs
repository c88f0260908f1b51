//! API error types.

use crate::metrics::record_upload_error;
use crate::sessions::UploadError;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use porter_core::UPLOAD_OFFSET_HEADER;
use porter_metadata::MetadataError;
use porter_storage::StorageError;
use serde::Serialize;

/// Seconds a client is asked to wait after `QueueFull`.
const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] porter_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Internal(_) => "internal_error",
            Self::Upload(e) => e.kind(),
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upload(e) => match e {
                UploadError::NotFound(_) => StatusCode::NOT_FOUND,
                UploadError::Forbidden(_) => StatusCode::FORBIDDEN,
                UploadError::InvalidState { .. } => StatusCode::CONFLICT,
                UploadError::OffsetMismatch { .. } => StatusCode::CONFLICT,
                UploadError::ChunkOutOfBounds { .. } => StatusCode::BAD_REQUEST,
                UploadError::Expired => StatusCode::GONE,
                UploadError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                UploadError::StorageWriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
                UploadError::ResourceLinkFailure(_) => StatusCode::BAD_GATEWAY,
                UploadError::ResourceRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                UploadError::LinkInProgress => StatusCode::CONFLICT,
                UploadError::Invalid(_) => StatusCode::BAD_REQUEST,
                UploadError::Metadata(e) => metadata_status(e),
                UploadError::Storage(e) => storage_status(e),
            },
            Self::Storage(e) => storage_status(e),
            Self::Metadata(e) => metadata_status(e),
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

fn metadata_status(err: &MetadataError) -> StatusCode {
    match err {
        MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
        MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
        MetadataError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        if let Self::Upload(e) = &self {
            record_upload_error(e.kind());
        }

        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();

        match &self {
            Self::Upload(UploadError::OffsetMismatch { expected, .. }) => {
                response
                    .headers_mut()
                    .insert(UPLOAD_OFFSET_HEADER, HeaderValue::from(*expected));
            }
            Self::Upload(UploadError::QueueFull { .. }) => {
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(QUEUE_FULL_RETRY_AFTER_SECS),
                );
            }
            _ => {}
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
