//! Upload session repository.
//!
//! Every mutation is a single conditional statement scoped by `upload_id`
//! (or by a status/time predicate for the reconciler's sweeps). A `false`
//! return means the row no longer matched what the caller observed; a
//! missing row is always `NotFound`.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{OffsetAdvance, UploadSessionRow};
use async_trait::async_trait;
use porter_core::UploadStatus;
use time::OffsetDateTime;
use uuid::Uuid;

/// Statuses that count toward admission, as a SQL list.
pub(crate) const ACTIVE_STATUSES_SQL: &str = "('queued', 'pending', 'uploading')";

/// Statuses holding a running slot, as a SQL list.
pub(crate) const RUNNING_STATUSES_SQL: &str = "('pending', 'uploading')";

/// Terminal statuses, as a SQL list.
pub(crate) const TERMINAL_STATUSES_SQL: &str = "('completed', 'failed', 'cancelled', 'expired')";

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert a new session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get a session by ID. Missing sessions are `NotFound`.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<UploadSessionRow>;

    /// List an owner's sessions, newest first.
    async fn list_sessions_by_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Advance the offset if the row still has the observed offset and status.
    /// Progress is recomputed from the new offset in the same statement.
    async fn update_offset(&self, advance: &OffsetAdvance) -> MetadataResult<bool>;

    /// Transition `expected -> status` if the row is still `expected` and no
    /// completion claim is held.
    async fn update_status(
        &self,
        upload_id: Uuid,
        expected: UploadStatus,
        status: UploadStatus,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Mark a session `Failed`, recording why and releasing any completion claim.
    async fn fail_session(
        &self,
        upload_id: Uuid,
        expected: UploadStatus,
        error_code: &str,
        error_detail: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Claim a fully received session for completion.
    ///
    /// Succeeds when no claim exists or the existing one started before
    /// `stale_before`.
    async fn begin_link(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Drop the completion claim started at `claimed_at` after a retryable
    /// collaborator failure. A claim taken over since then is left alone.
    async fn release_link(
        &self,
        upload_id: Uuid,
        claimed_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Mark a claimed session `Completed` and bind it to its resource.
    ///
    /// Only the holder of the claim started at `claimed_at` can complete.
    async fn complete_session(
        &self,
        upload_id: Uuid,
        claimed_at: OffsetDateTime,
        resource_id: &str,
        storage_path: &str,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete a session row.
    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<()>;

    /// Non-terminal sessions whose deadline is before `as_of`, earliest first.
    async fn list_expired(
        &self,
        as_of: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Pending or uploading sessions not updated since `stale_since`, stalest first.
    async fn list_abandoned(
        &self,
        stale_since: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Expire a session if its deadline is still before `now`.
    async fn expire_if_past_deadline(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Expire a session if it is still running and idle since `stale_since`.
    async fn expire_if_idle(
        &self,
        upload_id: Uuid,
        stale_since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Release completion claims older than `stale_before`. Returns the count released.
    async fn release_stale_links(
        &self,
        stale_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Count an owner's queued, pending and uploading sessions.
    async fn count_active_by_owner(&self, owner_id: &str) -> MetadataResult<u64>;

    /// Count an owner's pending and uploading sessions.
    async fn count_running_by_owner(&self, owner_id: &str) -> MetadataResult<u64>;

    /// Count an owner's queued sessions.
    async fn count_queued_by_owner(&self, owner_id: &str) -> MetadataResult<u64>;

    /// Count active sessions across all owners.
    async fn count_active(&self) -> MetadataResult<u64>;

    /// List an owner's active sessions, oldest first.
    async fn list_active_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Queued sessions across all owners, oldest first.
    async fn list_queued(&self, limit: u32) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Move the deadline to `expires_at` if that is later and the session is active.
    async fn extend_expiry(
        &self,
        upload_id: Uuid,
        expires_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete up to `limit` terminal sessions last updated before `before`.
    async fn purge_terminal(&self, before: OffsetDateTime, limit: u32) -> MetadataResult<u64>;
}

/// Reject transitions the status table forbids before they reach SQL.
pub(crate) fn check_transition(from: UploadStatus, to: UploadStatus) -> MetadataResult<()> {
    from.transition_to(to)?;
    Ok(())
}

/// Offset advances either keep the status or take the Pending -> Uploading edge.
pub(crate) fn check_transition_or_same(
    from: UploadStatus,
    to: UploadStatus,
) -> MetadataResult<()> {
    if from == to {
        return Ok(());
    }
    check_transition(from, to)
}

/// Resolve a zero-row conditional update: `NotFound` if the row is gone.
pub(crate) fn not_applied(exists: bool, upload_id: Uuid) -> MetadataResult<bool> {
    if exists {
        Ok(false)
    } else {
        Err(MetadataError::session_not_found(upload_id))
    }
}
