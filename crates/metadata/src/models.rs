//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use porter_core::{
    ChunkDigest, ChunkReceipt, UploadId, UploadKind, UploadMetadata, UploadSession, UploadStatus,
};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub owner_id: String,
    pub resource_id: Option<String>,
    pub kind: String,
    pub total_size: i64,
    pub upload_offset: i64,
    /// Always written from `upload_offset` in the same statement.
    pub progress: f64,
    pub storage_path: String,
    pub status: String,
    /// JSON object.
    pub metadata: String,
    pub last_chunk_offset: Option<i64>,
    pub last_chunk_size: Option<i64>,
    pub last_chunk_digest: Option<String>,
    /// Completion claim; non-null while the resource is being linked.
    pub link_started_at: Option<OffsetDateTime>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub trace_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl UploadSessionRow {
    /// Build the row for a newly admitted session.
    pub fn from_session(session: &UploadSession, trace_id: Option<String>) -> MetadataResult<Self> {
        let metadata = serde_json::to_string(&session.metadata)
            .map_err(|e| MetadataError::Internal(format!("failed to encode metadata: {e}")))?;
        Ok(Self {
            upload_id: *session.id.as_uuid(),
            owner_id: session.owner_id.clone(),
            resource_id: session.resource_id.clone(),
            kind: session.kind.as_str().to_string(),
            total_size: to_i64(session.total_size, "total_size")?,
            upload_offset: to_i64(session.offset, "offset")?,
            progress: session.progress(),
            storage_path: session.storage_path.clone(),
            status: session.status.as_str().to_string(),
            metadata,
            last_chunk_offset: None,
            last_chunk_size: None,
            last_chunk_digest: None,
            link_started_at: session.link_started_at,
            error_code: session.error_code.clone(),
            error_detail: session.error_detail.clone(),
            trace_id,
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
            completed_at: session.completed_at,
        })
    }

    /// Parsed status.
    pub fn status(&self) -> MetadataResult<UploadStatus> {
        Ok(UploadStatus::parse(&self.status)?)
    }

    /// Decode into the domain type, rejecting rows that violate its invariants.
    pub fn into_session(self) -> MetadataResult<UploadSession> {
        let status = UploadStatus::parse(&self.status)?;
        let kind = UploadKind::parse(&self.kind)?;
        let total_size = to_u64(self.total_size, "total_size")?;
        let offset = to_u64(self.upload_offset, "upload_offset")?;
        if offset > total_size {
            return Err(MetadataError::Corrupt(format!(
                "upload {} has offset {offset} beyond total size {total_size}",
                self.upload_id
            )));
        }
        let metadata: UploadMetadata = serde_json::from_str(&self.metadata).map_err(|e| {
            MetadataError::Corrupt(format!("upload {} metadata: {e}", self.upload_id))
        })?;
        let last_chunk = match (
            self.last_chunk_offset,
            self.last_chunk_size,
            self.last_chunk_digest.as_deref(),
        ) {
            (Some(chunk_offset), Some(size), Some(digest)) => Some(ChunkReceipt {
                offset: to_u64(chunk_offset, "last_chunk_offset")?,
                size: to_u64(size, "last_chunk_size")?,
                digest: ChunkDigest::from_hex(digest)?,
            }),
            _ => None,
        };

        Ok(UploadSession {
            id: UploadId::from_uuid(self.upload_id),
            owner_id: self.owner_id,
            resource_id: self.resource_id,
            kind,
            total_size,
            offset,
            storage_path: self.storage_path,
            status,
            metadata,
            last_chunk,
            link_started_at: self.link_started_at,
            error_code: self.error_code,
            error_detail: self.error_detail,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
        })
    }
}

/// Conditional offset advance for one accepted chunk.
///
/// Applies only while the row still has `expected_offset` and `expected_status`.
#[derive(Debug, Clone)]
pub struct OffsetAdvance {
    pub upload_id: Uuid,
    pub expected_offset: i64,
    pub expected_status: UploadStatus,
    pub new_offset: i64,
    pub new_status: UploadStatus,
    pub chunk_offset: i64,
    pub chunk_size: i64,
    pub chunk_digest: String,
    pub updated_at: OffsetDateTime,
}

impl OffsetAdvance {
    /// Advance past `receipt`, moving Pending sessions to Uploading.
    pub fn for_chunk(
        session: &UploadSession,
        receipt: &ChunkReceipt,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Self> {
        let new_offset = session.offset + receipt.size;
        let new_status = match session.status {
            UploadStatus::Pending => session.status.transition_to(UploadStatus::Uploading)?,
            other => other,
        };
        Ok(Self {
            upload_id: *session.id.as_uuid(),
            expected_offset: to_i64(session.offset, "offset")?,
            expected_status: session.status,
            new_offset: to_i64(new_offset, "offset")?,
            new_status,
            chunk_offset: to_i64(receipt.offset, "chunk offset")?,
            chunk_size: to_i64(receipt.size, "chunk size")?,
            chunk_digest: receipt.digest.to_hex(),
            updated_at,
        })
    }
}

fn to_i64(value: u64, field: &str) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("{field} {value} exceeds i64::MAX")))
}

fn to_u64(value: i64, field: &str) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("negative {field}: {value}")))
}
