//! Completion: bind a fully received upload to its domain resource, once.
//!
//! Completion claims the session in the metadata store before calling the
//! resource collaborator, so racing completions across processes invoke it
//! at most once per claim. A retryable collaborator failure releases the
//! claim and leaves the session `Uploading`.

use super::error::{UploadError, UploadResult};
use super::locks::SessionLocks;
use crate::metrics::{COMPLETION_DURATION, LINK_FAILURES, SESSIONS_COMPLETED};
use async_trait::async_trait;
use porter_core::{UploadId, UploadKind, UploadMetadata, UploadSession, UploadStatus};
use porter_metadata::MetadataStore;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::instrument;

/// Claim timestamps are compared for equality in the store, so keep them at
/// the microsecond precision every backend persists.
fn claim_timestamp(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// Everything the collaborator needs to create or update a resource.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// Stable across retries; collaborators use it as an idempotency key.
    pub upload_id: UploadId,
    pub owner_id: String,
    pub kind: UploadKind,
    /// Target of an update. `None` for creates.
    pub resource_id: Option<String>,
    /// Where the received bytes are.
    pub storage_path: String,
    pub metadata: UploadMetadata,
}

/// The resource a completed upload is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedResource {
    pub resource_id: String,
    /// Final location of the file, if the collaborator moved it.
    pub storage_path: String,
}

/// Collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Retrying completion later may succeed.
    #[error("{0}")]
    Transient(String),
    /// The collaborator will never accept this upload.
    #[error("{0}")]
    Rejected(String),
}

/// External repository that completed uploads attach to.
#[async_trait]
pub trait ResourceLinker: Send + Sync {
    /// Create a new resource from the uploaded file.
    async fn create_resource(&self, req: &LinkRequest) -> Result<LinkedResource, LinkError>;

    /// Replace the file of an existing resource.
    async fn update_resource(
        &self,
        resource_id: &str,
        req: &LinkRequest,
    ) -> Result<LinkedResource, LinkError>;
}

/// Result of a completion request.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub session: UploadSession,
    /// The session was completed by an earlier call.
    pub already_completed: bool,
}

/// Runs the completion transition.
pub struct CompletionLinker {
    metadata: Arc<dyn MetadataStore>,
    linker: Arc<dyn ResourceLinker>,
    locks: SessionLocks,
    link_timeout: time::Duration,
}

impl CompletionLinker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        linker: Arc<dyn ResourceLinker>,
        locks: SessionLocks,
        link_timeout: time::Duration,
    ) -> Self {
        Self {
            metadata,
            linker,
            locks,
            link_timeout,
        }
    }

    async fn load(&self, id: UploadId) -> UploadResult<UploadSession> {
        Ok(self.metadata.get_session(*id.as_uuid()).await?.into_session()?)
    }

    fn already_completed(session: UploadSession) -> CompletionOutcome {
        CompletionOutcome {
            session,
            already_completed: true,
        }
    }

    /// Complete `id`. Completing an already completed session succeeds
    /// without calling the collaborator again.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn complete(&self, owner_id: &str, id: UploadId) -> UploadResult<CompletionOutcome> {
        let started = Instant::now();
        let _guard = self.locks.acquire(id).await;
        let session = self.load(id).await?;
        if session.owner_id != owner_id {
            return Err(UploadError::Forbidden(id.to_string()));
        }

        match session.status {
            UploadStatus::Completed => return Ok(Self::already_completed(session)),
            UploadStatus::Expired => return Err(UploadError::Expired),
            status if status.is_terminal() => {
                return Err(UploadError::invalid_state(status, "complete"));
            }
            _ => {}
        }

        let now = OffsetDateTime::now_utc();
        if session.is_expired_at(now) {
            return Err(UploadError::Expired);
        }
        if !session.is_ready_to_complete() {
            return Err(UploadError::invalid_state(session.status, "complete"));
        }

        let claimed_at = claim_timestamp(now);
        if !self
            .metadata
            .begin_link(*id.as_uuid(), claimed_at, now - self.link_timeout)
            .await?
        {
            let current = self.load(id).await?;
            return match current.status {
                UploadStatus::Completed => Ok(Self::already_completed(current)),
                _ if current.link_started_at.is_some() => Err(UploadError::LinkInProgress),
                status => Err(UploadError::invalid_state(status, "complete")),
            };
        }

        let req = LinkRequest {
            upload_id: id,
            owner_id: session.owner_id.clone(),
            kind: session.kind,
            resource_id: session.resource_id.clone(),
            storage_path: session.storage_path.clone(),
            metadata: session.metadata.clone(),
        };
        let linked = match (session.kind, session.resource_id.as_deref()) {
            (UploadKind::UpdateResource, Some(resource_id)) => {
                self.linker.update_resource(resource_id, &req).await
            }
            (UploadKind::UpdateResource, None) => Err(LinkError::Rejected(
                "update upload has no resource_id".to_string(),
            )),
            (UploadKind::CreateResource, _) => self.linker.create_resource(&req).await,
        };

        match linked {
            Ok(linked) => self.finish(session, claimed_at, linked, started).await,
            Err(LinkError::Transient(reason)) => {
                LINK_FAILURES.inc();
                tracing::warn!(upload_id = %id, error = %reason, "Resource link failed, completion can be retried");
                if !self
                    .metadata
                    .release_link(*id.as_uuid(), claimed_at, OffsetDateTime::now_utc())
                    .await?
                {
                    tracing::warn!(upload_id = %id, "Completion claim was taken over before release");
                }
                Err(UploadError::ResourceLinkFailure(reason))
            }
            Err(LinkError::Rejected(reason)) => {
                LINK_FAILURES.inc();
                tracing::warn!(upload_id = %id, error = %reason, "Resource rejected upload, marking failed");
                self.metadata
                    .fail_session(
                        *id.as_uuid(),
                        session.status,
                        "resource_rejected",
                        &reason,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                Err(UploadError::ResourceRejected(reason))
            }
        }
    }

    async fn finish(
        &self,
        mut session: UploadSession,
        claimed_at: OffsetDateTime,
        linked: LinkedResource,
        started: Instant,
    ) -> UploadResult<CompletionOutcome> {
        let id = session.id;
        let completed_at = OffsetDateTime::now_utc();
        if !self
            .metadata
            .complete_session(
                *id.as_uuid(),
                claimed_at,
                &linked.resource_id,
                &linked.storage_path,
                completed_at,
            )
            .await?
        {
            let current = self.load(id).await?;
            if current.status == UploadStatus::Completed {
                return Ok(Self::already_completed(current));
            }
            tracing::error!(
                upload_id = %id,
                resource_id = %linked.resource_id,
                status = %current.status,
                "Resource linked but completion claim was lost"
            );
            return Err(UploadError::ResourceLinkFailure(
                "completion claim lost before the session was marked complete".to_string(),
            ));
        }

        session.status = UploadStatus::Completed;
        session.resource_id = Some(linked.resource_id);
        session.storage_path = linked.storage_path;
        session.link_started_at = None;
        session.completed_at = Some(completed_at);
        session.updated_at = completed_at;

        SESSIONS_COMPLETED.inc();
        COMPLETION_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::info!(
            upload_id = %id,
            resource_id = ?session.resource_id,
            storage_path = %session.storage_path,
            "Upload completed"
        );

        Ok(CompletionOutcome {
            session,
            already_completed: false,
        })
    }
}
