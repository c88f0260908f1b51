//! Offset protocol: create, append, query, cancel and extend upload sessions.
//!
//! An append is accepted only at the session's current offset. The bytes go
//! to the object store first; the offset advances afterwards through a
//! conditional update, so a failed write never moves the session and a lost
//! race is detected instead of double counting.

use super::admission::{AdmissionController, SlotStatus};
use super::error::{UploadError, UploadResult};
use super::locks::SessionLocks;
use crate::metrics::{
    APPEND_DURATION, BYTES_RECEIVED, CHUNK_REPLAYS, CHUNKS_APPENDED, OFFSET_MISMATCHES,
    SESSIONS_CANCELLED, SESSIONS_CREATED, SESSIONS_QUEUED, STORAGE_WRITE_FAILURES,
};
use bytes::Bytes;
use porter_core::config::UploadConfig;
use porter_core::upload::{CreateUploadRequest, validate_resource_id};
use porter_core::{ChunkReceipt, UploadId, UploadKind, UploadSession, UploadStatus};
use porter_metadata::MetadataStore;
use porter_metadata::models::{OffsetAdvance, UploadSessionRow};
use porter_storage::ObjectStore;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::instrument;

/// Result of an accepted append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Session state after the append.
    pub session: UploadSession,
    /// The chunk repeated the last accepted one and was acknowledged again.
    pub replayed: bool,
}

impl AppendOutcome {
    /// Every byte is received; the caller should run completion.
    pub fn ready_to_complete(&self) -> bool {
        self.session.is_ready_to_complete()
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub session: UploadSession,
    /// The session had already finished; nothing changed.
    pub already_terminal: bool,
}

/// Session operations driven by client requests.
pub struct UploadProtocol {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    admission: Arc<AdmissionController>,
    locks: SessionLocks,
    config: UploadConfig,
}

impl UploadProtocol {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        admission: Arc<AdmissionController>,
        locks: SessionLocks,
        config: UploadConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            admission,
            locks,
            config,
        }
    }

    /// Advisory slot check for `owner_id`.
    pub async fn request_slot(&self, owner_id: &str) -> UploadResult<SlotStatus> {
        self.admission.request_slot(owner_id).await
    }

    fn validate_create(&self, req: &CreateUploadRequest) -> UploadResult<()> {
        if req.total_size > self.config.max_upload_size {
            return Err(UploadError::Invalid(format!(
                "total_size {} exceeds maximum {}",
                req.total_size, self.config.max_upload_size
            )));
        }
        match (req.kind, req.resource_id.as_deref()) {
            (UploadKind::UpdateResource, None) => {
                return Err(UploadError::Invalid(
                    "update_resource uploads require resource_id".to_string(),
                ));
            }
            (UploadKind::UpdateResource, Some(id)) => {
                validate_resource_id(id).map_err(|e| UploadError::Invalid(e.to_string()))?;
            }
            (UploadKind::CreateResource, Some(_)) => {
                return Err(UploadError::Invalid(
                    "create_resource uploads cannot name a resource_id".to_string(),
                ));
            }
            _ => {}
        }
        if req.expires_in_secs == Some(0) {
            return Err(UploadError::Invalid(
                "expires_in_secs must be greater than 0".to_string(),
            ));
        }
        let metadata_len = serde_json::to_vec(&req.metadata)
            .map_err(|e| UploadError::Invalid(format!("invalid metadata: {e}")))?
            .len();
        if metadata_len > self.config.max_metadata_bytes {
            return Err(UploadError::Invalid(format!(
                "metadata is {metadata_len} bytes, maximum is {}",
                self.config.max_metadata_bytes
            )));
        }
        Ok(())
    }

    /// Admit and record a new session at offset 0.
    #[instrument(skip(self, req, trace_id), fields(kind = %req.kind.as_str(), total_size = req.total_size))]
    pub async fn create(
        &self,
        owner_id: &str,
        req: CreateUploadRequest,
        trace_id: Option<String>,
    ) -> UploadResult<UploadSession> {
        self.validate_create(&req)?;
        let status = self.admission.admit(owner_id).await?;

        let id = UploadId::new();
        let storage_path = format!("{}/{}", self.config.staging_prefix, id);
        self.storage
            .create(&storage_path)
            .await
            .map_err(UploadError::StorageWriteFailure)?;

        let now = OffsetDateTime::now_utc();
        let session = UploadSession {
            id,
            owner_id: owner_id.to_string(),
            resource_id: req.resource_id,
            kind: req.kind,
            total_size: req.total_size,
            offset: 0,
            storage_path,
            status,
            metadata: req.metadata,
            last_chunk: None,
            link_started_at: None,
            error_code: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.resolve_ttl(req.expires_in_secs),
            completed_at: None,
        };

        let row = UploadSessionRow::from_session(&session, trace_id)?;
        if let Err(e) = self.metadata.create_session(&row).await {
            if let Err(cleanup) = self.storage.delete(&session.storage_path).await {
                tracing::warn!(
                    upload_id = %id,
                    error = %cleanup,
                    "Failed to remove staged file after create failure"
                );
            }
            return Err(e.into());
        }

        SESSIONS_CREATED.inc();
        if status == UploadStatus::Queued {
            SESSIONS_QUEUED.inc();
        }
        tracing::info!(
            upload_id = %id,
            owner_id = %owner_id,
            status = %status,
            expires_at = %session.expires_at,
            "Upload session created"
        );
        Ok(session)
    }

    /// Load a session and check that `owner_id` may act on it.
    pub async fn load_owned(&self, owner_id: &str, id: UploadId) -> UploadResult<UploadSession> {
        let session = self.metadata.get_session(*id.as_uuid()).await?.into_session()?;
        if session.owner_id != owner_id {
            return Err(UploadError::Forbidden(id.to_string()));
        }
        Ok(session)
    }

    async fn reload(&self, id: UploadId) -> UploadResult<UploadSession> {
        Ok(self.metadata.get_session(*id.as_uuid()).await?.into_session()?)
    }

    /// Current state, used by clients to resume after a disconnect.
    pub async fn query(&self, owner_id: &str, id: UploadId) -> UploadResult<UploadSession> {
        self.load_owned(owner_id, id).await
    }

    /// The owner's sessions, newest first.
    pub async fn list(&self, owner_id: &str, limit: u32) -> UploadResult<Vec<UploadSession>> {
        self.metadata
            .list_sessions_by_owner(owner_id, limit)
            .await?
            .into_iter()
            .map(|row| row.into_session().map_err(UploadError::from))
            .collect()
    }

    /// Append `data` at `chunk_offset`.
    ///
    /// A byte-for-byte repeat of the last accepted chunk is acknowledged
    /// without touching storage. Any other offset fails `OffsetMismatch`.
    #[instrument(skip(self, data), fields(upload_id = %id, len = data.len()))]
    pub async fn append_chunk(
        &self,
        owner_id: &str,
        id: UploadId,
        chunk_offset: u64,
        data: Bytes,
    ) -> UploadResult<AppendOutcome> {
        let started = Instant::now();
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_owned(owner_id, id).await?;
        let now = OffsetDateTime::now_utc();

        // Checked before promotion so an expired queued session never takes a slot.
        if !session.status.is_terminal() && session.is_expired_at(now) {
            return Err(UploadError::Expired);
        }

        if session.status == UploadStatus::Queued {
            if !self
                .admission
                .try_promote(owner_id, *id.as_uuid(), now)
                .await?
            {
                let slot = self.admission.request_slot(owner_id).await?;
                return Err(UploadError::QueueFull {
                    active: slot.active,
                    max_concurrent: slot.max_concurrent,
                });
            }
            session = self.reload(id).await?;
        }

        if !session.status.accepts_chunks() {
            return Err(UploadError::invalid_state(session.status, "append to"));
        }

        if chunk_offset != session.offset {
            return self.replay_or_mismatch(session, chunk_offset, &data);
        }
        if data.is_empty() {
            return Ok(AppendOutcome {
                session,
                replayed: false,
            });
        }

        let len = data.len() as u64;
        if session.offset + len > session.total_size {
            return Err(UploadError::ChunkOutOfBounds {
                offset: chunk_offset,
                len,
                total_size: session.total_size,
            });
        }

        let receipt = ChunkReceipt::for_chunk(chunk_offset, &data);
        if let Err(e) = self
            .storage
            .write_at(&session.storage_path, chunk_offset, data.clone())
            .await
        {
            STORAGE_WRITE_FAILURES.inc();
            tracing::warn!(
                upload_id = %id,
                offset = chunk_offset,
                error = %e,
                "Chunk write failed, offset not advanced"
            );
            return Err(UploadError::StorageWriteFailure(e));
        }

        let advance = OffsetAdvance::for_chunk(&session, &receipt, now)?;
        if !self.metadata.update_offset(&advance).await? {
            // Another writer moved the session between our read and write.
            let current = self.reload(id).await?;
            if !current.status.accepts_chunks() {
                return Err(UploadError::invalid_state(current.status, "append to"));
            }
            return self.replay_or_mismatch(current, chunk_offset, &data);
        }

        session.offset += len;
        session.status = advance.new_status;
        session.updated_at = now;
        session.last_chunk = Some(receipt);

        CHUNKS_APPENDED.inc();
        BYTES_RECEIVED.inc_by(len);
        APPEND_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::debug!(
            upload_id = %id,
            offset = session.offset,
            total_size = session.total_size,
            progress = session.progress(),
            "Chunk appended"
        );

        Ok(AppendOutcome {
            session,
            replayed: false,
        })
    }

    fn replay_or_mismatch(
        &self,
        session: UploadSession,
        chunk_offset: u64,
        data: &[u8],
    ) -> UploadResult<AppendOutcome> {
        if session.is_replay(chunk_offset, data) {
            CHUNK_REPLAYS.inc();
            tracing::debug!(
                upload_id = %session.id,
                chunk_offset,
                offset = session.offset,
                "Acknowledging replayed chunk"
            );
            return Ok(AppendOutcome {
                session,
                replayed: true,
            });
        }
        OFFSET_MISMATCHES.inc();
        Err(UploadError::OffsetMismatch {
            expected: session.offset,
            actual: chunk_offset,
        })
    }

    /// Cancel a session and free its slot. A finished session is left as is.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn cancel(&self, owner_id: &str, id: UploadId) -> UploadResult<CancelOutcome> {
        let _guard = self.locks.acquire(id).await;
        let mut session = self.load_owned(owner_id, id).await?;

        // A concurrent status change from another process is retried against the new status.
        for _ in 0..3 {
            if session.status.is_terminal() {
                return Ok(CancelOutcome {
                    session,
                    already_terminal: true,
                });
            }
            if session.link_started_at.is_some() {
                return Err(UploadError::LinkInProgress);
            }

            let now = OffsetDateTime::now_utc();
            if self
                .metadata
                .update_status(*id.as_uuid(), session.status, UploadStatus::Cancelled, now)
                .await?
            {
                session.status = UploadStatus::Cancelled;
                session.updated_at = now;
                SESSIONS_CANCELLED.inc();
                tracing::info!(upload_id = %id, owner_id = %owner_id, "Upload cancelled");

                if let Err(e) = self.storage.delete(&session.storage_path).await {
                    tracing::warn!(
                        upload_id = %id,
                        storage_path = %session.storage_path,
                        error = %e,
                        "Failed to delete staged bytes of cancelled upload"
                    );
                }
                return Ok(CancelOutcome {
                    session,
                    already_terminal: false,
                });
            }
            session = self.reload(id).await?;
        }

        Err(UploadError::invalid_state(session.status, "cancel"))
    }

    /// Push the deadline to `now + expires_in_secs`, capped by the maximum
    /// lifetime. The deadline never moves backward.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn extend(
        &self,
        owner_id: &str,
        id: UploadId,
        expires_in_secs: u64,
    ) -> UploadResult<UploadSession> {
        if expires_in_secs == 0 {
            return Err(UploadError::Invalid(
                "expires_in_secs must be greater than 0".to_string(),
            ));
        }

        let session = self.load_owned(owner_id, id).await?;
        if session.status.is_terminal() {
            return Err(UploadError::invalid_state(session.status, "extend"));
        }
        let now = OffsetDateTime::now_utc();
        if session.is_expired_at(now) {
            return Err(UploadError::Expired);
        }

        let requested = now + self.config.resolve_ttl(Some(expires_in_secs));
        let ceiling = session.created_at + self.config.max_ttl();
        let expires_at = requested.min(ceiling);
        if expires_at <= session.expires_at {
            return Ok(session);
        }

        if self
            .metadata
            .extend_expiry(*id.as_uuid(), expires_at, now)
            .await?
        {
            tracing::info!(upload_id = %id, expires_at = %expires_at, "Upload deadline extended");
        }

        let current = self.reload(id).await?;
        if current.status.is_terminal() {
            return Err(UploadError::invalid_state(current.status, "extend"));
        }
        Ok(current)
    }
}
