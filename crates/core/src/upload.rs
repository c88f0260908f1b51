//! Upload session types and lifecycle.

use crate::digest::ChunkReceipt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(e.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the upload will be bound to once complete. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// A new resource is created from the uploaded file.
    CreateResource,
    /// An existing resource has its file replaced.
    UpdateResource,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateResource => "create_resource",
            Self::UpdateResource => "update_resource",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "create_resource" => Ok(Self::CreateResource),
            "update_resource" => Ok(Self::UpdateResource),
            other => Err(crate::Error::InvalidKind(other.to_string())),
        }
    }
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload session status.
///
/// ```text
/// Queued -> Pending -> Uploading -> Completed | Failed | Cancelled
/// Queued | Pending | Uploading -> Cancelled | Expired
/// ```
///
/// `Completed`, `Failed`, `Cancelled` and `Expired` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Admission was denied; waiting for a free slot.
    Queued,
    /// Admitted, no bytes received yet.
    Pending,
    /// At least one chunk accepted.
    Uploading,
    /// Linked to its resource.
    Completed,
    /// The resource collaborator permanently rejected the upload.
    Failed,
    /// Cancelled by the client.
    Cancelled,
    /// Deadline passed or abandoned mid-transfer.
    Expired,
}

impl UploadStatus {
    /// Statuses that count against an owner's concurrency limit.
    pub const ACTIVE: [UploadStatus; 3] = [Self::Queued, Self::Pending, Self::Uploading];

    /// Statuses that hold a running slot (admitted and not finished).
    pub const RUNNING: [UploadStatus; 2] = [Self::Pending, Self::Uploading];

    /// Statuses that are never left once entered.
    pub const TERMINAL: [UploadStatus; 4] = [
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Check if the session counts toward admission limits.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Pending | Self::Uploading)
    }

    /// Check if the session may receive chunks.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploading)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Transition validity table.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Queued, Pending | Cancelled | Expired)
                | (Pending, Uploading | Completed | Failed | Cancelled | Expired)
                | (Uploading, Completed | Failed | Cancelled | Expired)
        )
    }

    /// Validate a transition, returning the new status.
    pub fn transition_to(&self, next: UploadStatus) -> crate::Result<UploadStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Percentage of the declared size received so far.
///
/// Defined as 0 for empty uploads.
pub fn compute_progress(offset: u64, total_size: u64) -> f64 {
    if total_size == 0 {
        return 0.0;
    }
    (offset as f64 / total_size as f64) * 100.0
}

/// Descriptive payload supplied at creation (title, category, ...).
pub type UploadMetadata = serde_json::Map<String, serde_json::Value>;

/// An upload session tracking resumable upload state.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub id: UploadId,
    /// Requesting user, used for concurrency accounting.
    pub owner_id: String,
    /// Bound resource. Present from creation for updates, set on completion for creates.
    pub resource_id: Option<String>,
    pub kind: UploadKind,
    pub total_size: u64,
    /// Bytes durably received.
    pub offset: u64,
    /// Where the bytes live: the staging key until completion, then the final key.
    pub storage_path: String,
    pub status: UploadStatus,
    pub metadata: UploadMetadata,
    /// Last accepted chunk, for replay detection.
    pub last_chunk: Option<ChunkReceipt>,
    /// Set while a completion is linking the resource.
    pub link_started_at: Option<OffsetDateTime>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl UploadSession {
    /// Progress derived from the current offset.
    pub fn progress(&self) -> f64 {
        if self.status == UploadStatus::Completed {
            return 100.0;
        }
        compute_progress(self.offset, self.total_size)
    }

    /// Bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.offset)
    }

    /// Check if the hard deadline has passed.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Check if every declared byte has been received.
    pub fn is_fully_received(&self) -> bool {
        self.offset == self.total_size
    }

    /// Check if completion may link this session.
    ///
    /// Empty uploads never receive a chunk and complete straight from `Pending`.
    pub fn is_ready_to_complete(&self) -> bool {
        self.is_fully_received()
            && (self.status == UploadStatus::Uploading
                || (self.status == UploadStatus::Pending && self.total_size == 0))
    }

    /// Whether a delivery at `chunk_offset` repeats the last accepted chunk.
    pub fn is_replay(&self, chunk_offset: u64, data: &[u8]) -> bool {
        self.last_chunk
            .is_some_and(|receipt| receipt.matches(chunk_offset, data))
    }
}

/// Check that a resource id is usable as one storage path segment.
pub fn validate_resource_id(resource_id: &str) -> crate::Result<()> {
    let valid = !resource_id.is_empty()
        && resource_id.len() <= 128
        && resource_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && resource_id != "."
        && resource_id != "..";
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidResourceId(resource_id.to_string()))
    }
}

/// Request to create an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateUploadRequest {
    pub kind: UploadKind,
    /// Declared byte length.
    pub total_size: u64,
    #[serde(default)]
    pub metadata: UploadMetadata,
    /// Resource to update. Required for `update_resource`, rejected otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Requested lifetime. Capped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

/// Response from creating an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub upload_id: String,
    /// URL to send chunks to.
    pub location: String,
    /// Staging key the bytes are written to.
    pub storage_path: String,
    pub offset: u64,
    pub status: UploadStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response from appending a chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendChunkResponse {
    pub upload_id: String,
    pub offset: u64,
    pub length: u64,
    pub progress: f64,
    pub status: UploadStatus,
    /// Every byte is received; the client should call complete.
    pub ready_to_complete: bool,
    /// The chunk repeated the last accepted one and was not written again.
    #[serde(default)]
    pub replayed: bool,
}

/// Response from querying upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStateResponse {
    pub upload_id: String,
    pub kind: UploadKind,
    pub status: UploadStatus,
    pub offset: u64,
    pub length: u64,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub metadata: UploadMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<OffsetDateTime>,
}

impl From<&UploadSession> for UploadStateResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id.to_string(),
            kind: session.kind,
            status: session.status,
            offset: session.offset,
            length: session.total_size,
            progress: session.progress(),
            resource_id: session.resource_id.clone(),
            metadata: session.metadata.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
            completed_at: session.completed_at,
        }
    }
}

/// Response listing an owner's sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListUploadsResponse {
    pub uploads: Vec<UploadStateResponse>,
}

/// Response from completing an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub upload_id: String,
    pub resource_id: String,
    pub storage_path: String,
    pub status: UploadStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    /// The session had already been completed by an earlier call.
    #[serde(default)]
    pub already_completed: bool,
}

/// Response from cancelling an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelUploadResponse {
    pub upload_id: String,
    pub status: UploadStatus,
    /// The session was already terminal; nothing changed.
    #[serde(default)]
    pub already_terminal: bool,
}

/// Request to push an upload's deadline out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendUploadRequest {
    pub expires_in_secs: u64,
}

/// Advisory admission feedback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResponse {
    pub available: bool,
    /// Sessions counted against the limit (queued, pending, uploading).
    pub active: u64,
    /// Sessions of this owner waiting in the queue.
    pub queue_length: u64,
    pub max_concurrent: u32,
}
