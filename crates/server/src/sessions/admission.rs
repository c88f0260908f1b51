//! Admission control: how many sessions an owner may have in flight.
//!
//! Counts are read from the metadata store on every call. Check and create
//! are not atomic, so two simultaneous creates may both be admitted.

use super::error::{UploadError, UploadResult};
use crate::metrics::{SESSIONS_PROMOTED, SESSIONS_REJECTED};
use porter_core::UploadStatus;
use porter_core::config::{AdmissionConfig, QueuePolicy};
use porter_metadata::MetadataStore;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Advisory admission feedback for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub available: bool,
    /// Queued, pending and uploading sessions.
    pub active: u64,
    /// Sessions waiting in the queue.
    pub queue_length: u64,
    pub max_concurrent: u32,
}

/// Gate in front of session creation.
pub struct AdmissionController {
    metadata: Arc<dyn MetadataStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(metadata: Arc<dyn MetadataStore>, config: AdmissionConfig) -> Self {
        Self { metadata, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Report whether `owner_id` could start an upload right now. Read only.
    #[instrument(skip(self))]
    pub async fn request_slot(&self, owner_id: &str) -> UploadResult<SlotStatus> {
        let active = self.metadata.count_active_by_owner(owner_id).await?;
        let queue_length = self.metadata.count_queued_by_owner(owner_id).await?;
        let mut available = active < u64::from(self.config.max_concurrent_per_owner);

        if available && let Some(global) = self.config.max_concurrent_global {
            available = self.metadata.count_active().await? < u64::from(global);
        }

        Ok(SlotStatus {
            available,
            active,
            queue_length,
            max_concurrent: self.config.max_concurrent_per_owner,
        })
    }

    /// Decide the initial status of a new session for `owner_id`.
    ///
    /// Returns `Pending` when a slot is free. Otherwise the queue policy
    /// decides between `Queued` and `QueueFull`.
    #[instrument(skip(self))]
    pub async fn admit(&self, owner_id: &str) -> UploadResult<UploadStatus> {
        let slot = self.request_slot(owner_id).await?;
        if slot.available {
            return Ok(UploadStatus::Pending);
        }

        let queue_full = UploadError::QueueFull {
            active: slot.active,
            max_concurrent: slot.max_concurrent,
        };
        match self.config.queue_policy {
            QueuePolicy::Queue if slot.queue_length < u64::from(self.config.max_queued_per_owner) => {
                tracing::debug!(
                    owner_id = %owner_id,
                    queue_length = slot.queue_length,
                    "No free slot, queueing upload"
                );
                Ok(UploadStatus::Queued)
            }
            _ => {
                SESSIONS_REJECTED.inc();
                tracing::info!(
                    owner_id = %owner_id,
                    active = slot.active,
                    max_concurrent = slot.max_concurrent,
                    "Upload admission denied"
                );
                Err(queue_full)
            }
        }
    }

    /// Number of running slots (pending or uploading) the owner has free.
    async fn free_running_slots(&self, owner_id: &str) -> UploadResult<u64> {
        let running = self.metadata.count_running_by_owner(owner_id).await?;
        Ok(u64::from(self.config.max_concurrent_per_owner).saturating_sub(running))
    }

    /// Promote the owner's oldest queued sessions into free running slots.
    /// Returns how many were promoted.
    #[instrument(skip(self, now))]
    pub async fn promote_owner(&self, owner_id: &str, now: OffsetDateTime) -> UploadResult<u64> {
        let free = self.free_running_slots(owner_id).await?;
        if free == 0 {
            return Ok(0);
        }

        let mut promoted = 0;
        let queued = self
            .metadata
            .list_active_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|row| row.status == UploadStatus::Queued.as_str());
        for row in queued {
            if promoted >= free {
                break;
            }
            if self
                .metadata
                .update_status(row.upload_id, UploadStatus::Queued, UploadStatus::Pending, now)
                .await?
            {
                promoted += 1;
                SESSIONS_PROMOTED.inc();
                tracing::info!(upload_id = %row.upload_id, owner_id = %owner_id, "Promoted queued upload");
            }
        }
        Ok(promoted)
    }

    /// Promote one queued session if it is among the oldest that fit.
    ///
    /// Returns whether the session is now `Pending`.
    pub async fn try_promote(
        &self,
        owner_id: &str,
        upload_id: uuid::Uuid,
        now: OffsetDateTime,
    ) -> UploadResult<bool> {
        let free = self.free_running_slots(owner_id).await?;
        if free == 0 {
            return Ok(false);
        }

        let eligible = self
            .metadata
            .list_active_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|row| row.status == UploadStatus::Queued.as_str())
            .take(usize::try_from(free).unwrap_or(usize::MAX))
            .any(|row| row.upload_id == upload_id);
        if !eligible {
            return Ok(false);
        }

        let promoted = self
            .metadata
            .update_status(upload_id, UploadStatus::Queued, UploadStatus::Pending, now)
            .await?;
        if promoted {
            SESSIONS_PROMOTED.inc();
            tracing::info!(upload_id = %upload_id, owner_id = %owner_id, "Promoted queued upload on append");
        }
        Ok(promoted)
    }
}
