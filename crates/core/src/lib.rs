//! Core domain types and shared logic for the porter upload service.
//!
//! This crate defines the data model used across all other crates:
//! - Upload session identity, kind and status state machine
//! - Progress derivation from the received offset
//! - Chunk digests for replay detection
//! - Wire request/response types
//! - Application configuration

pub mod config;
pub mod digest;
pub mod error;
pub mod upload;

pub use digest::{ChunkDigest, ChunkReceipt};
pub use error::{Error, Result};
pub use upload::{UploadId, UploadKind, UploadMetadata, UploadSession, UploadStatus, compute_progress};

/// Default maximum chunk size accepted per append: 16 MiB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default maximum declared upload size: 10 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Request header carrying the client's expected offset.
pub const UPLOAD_OFFSET_HEADER: &str = "upload-offset";

/// Response header carrying the declared upload length.
pub const UPLOAD_LENGTH_HEADER: &str = "upload-length";

/// Response header carrying the session status.
pub const UPLOAD_STATUS_HEADER: &str = "upload-status";
