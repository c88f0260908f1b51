//! Background lifecycle reconciliation.
//!
//! Each cycle expires sessions past their deadline, expires running
//! sessions with no activity within the abandonment timeout, releases
//! stale completion claims, promotes queued sessions and removes the staged
//! bytes of everything it expired. Every transition re-checks its predicate
//! inside the UPDATE, so a session touched by a writer after being listed
//! is left alone.

use super::admission::AdmissionController;
use crate::metrics::{
    LINKS_RELEASED, RECONCILE_DURATION, RECONCILE_ERRORS, SESSIONS_ABANDONED, SESSIONS_EXPIRED,
    SESSIONS_PURGED,
};
use porter_core::config::ReconcilerConfig;
use porter_metadata::MetadataStore;
use porter_metadata::models::UploadSessionRow;
use porter_storage::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts from one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub expired: u64,
    pub abandoned: u64,
    pub links_released: u64,
    pub promoted: u64,
    pub staged_deleted: u64,
    pub purged: u64,
    pub errors: u64,
}

impl ReconcileStats {
    fn touched_anything(&self) -> bool {
        self.expired + self.abandoned + self.links_released + self.promoted + self.purged > 0
    }
}

/// Which sweep expired a session.
#[derive(Clone, Copy)]
enum Sweep {
    Deadline,
    Idle { stale_since: OffsetDateTime },
}

impl Sweep {
    fn name(&self) -> &'static str {
        match self {
            Self::Deadline => "expiration",
            Self::Idle { .. } => "abandonment",
        }
    }
}

/// Periodic sweeper over the session store.
pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    admission: Arc<AdmissionController>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        admission: Arc<AdmissionController>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            admission,
            config,
        }
    }

    /// Run one full cycle as of `now`. Per-session failures are logged and
    /// counted in `errors`; they never stop the cycle.
    pub async fn run_cycle(&self, now: OffsetDateTime) -> ReconcileStats {
        let started = Instant::now();
        let mut stats = ReconcileStats::default();
        let mut staged = Vec::new();

        self.sweep(Sweep::Deadline, now, &mut stats, &mut staged).await;
        let stale_since = now - self.config.abandon_timeout();
        self.sweep(Sweep::Idle { stale_since }, now, &mut stats, &mut staged)
            .await;
        self.release_stale_links(now, &mut stats).await;
        self.promote_queued(now, &mut stats).await;

        for path in staged {
            match self.storage.delete(&path).await {
                Ok(()) => stats.staged_deleted += 1,
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(storage_path = %path, error = %e, "Failed to delete staged bytes");
                }
            }
        }

        if let Some(retention) = self.config.retention() {
            self.purge(now - retention, &mut stats).await;
        }

        RECONCILE_DURATION.observe(started.elapsed().as_secs_f64());
        RECONCILE_ERRORS.inc_by(stats.errors);
        stats
    }

    async fn list(&self, sweep: Sweep, now: OffsetDateTime) -> Option<Vec<UploadSessionRow>> {
        let result = match sweep {
            Sweep::Deadline => self.metadata.list_expired(now, self.config.batch_size).await,
            Sweep::Idle { stale_since } => {
                self.metadata
                    .list_abandoned(stale_since, self.config.batch_size)
                    .await
            }
        };
        match result {
            Ok(rows) => Some(rows),
            Err(e) => {
                tracing::error!(sweep = sweep.name(), error = %e, "Failed to list sessions");
                None
            }
        }
    }

    async fn sweep(
        &self,
        sweep: Sweep,
        now: OffsetDateTime,
        stats: &mut ReconcileStats,
        staged: &mut Vec<String>,
    ) {
        for _ in 0..self.config.max_batches {
            let Some(rows) = self.list(sweep, now).await else {
                stats.errors += 1;
                return;
            };
            let full_batch = rows.len() >= self.config.batch_size as usize;
            let mut transitioned = 0;

            for row in rows {
                let result = match sweep {
                    Sweep::Deadline => self.metadata.expire_if_past_deadline(row.upload_id, now).await,
                    Sweep::Idle { stale_since } => {
                        self.metadata
                            .expire_if_idle(row.upload_id, stale_since, now)
                            .await
                    }
                };
                match result {
                    Ok(true) => {
                        transitioned += 1;
                        match sweep {
                            Sweep::Deadline => {
                                stats.expired += 1;
                                SESSIONS_EXPIRED.inc();
                            }
                            Sweep::Idle { .. } => {
                                stats.abandoned += 1;
                                SESSIONS_ABANDONED.inc();
                            }
                        }
                        tracing::info!(
                            upload_id = %row.upload_id,
                            owner_id = %row.owner_id,
                            previous_status = %row.status,
                            sweep = sweep.name(),
                            "Upload session expired"
                        );
                        staged.push(row.storage_path);
                    }
                    Ok(false) => {
                        tracing::debug!(
                            upload_id = %row.upload_id,
                            sweep = sweep.name(),
                            "Session changed since it was listed, skipping"
                        );
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            upload_id = %row.upload_id,
                            sweep = sweep.name(),
                            error = %e,
                            "Failed to expire session"
                        );
                    }
                }
            }

            if !full_batch || transitioned == 0 {
                return;
            }
        }
        tracing::warn!(
            sweep = sweep.name(),
            max_batches = self.config.max_batches,
            "Sweep hit its batch limit, remaining sessions wait for the next cycle"
        );
    }

    async fn release_stale_links(&self, now: OffsetDateTime, stats: &mut ReconcileStats) {
        let stale_before = now - self.config.link_timeout();
        match self.metadata.release_stale_links(stale_before, now).await {
            Ok(released) => {
                if released > 0 {
                    LINKS_RELEASED.inc_by(released);
                    tracing::warn!(released, "Released stale completion claims");
                }
                stats.links_released += released;
            }
            Err(e) => {
                stats.errors += 1;
                tracing::error!(error = %e, "Failed to release stale completion claims");
            }
        }
    }

    async fn promote_queued(&self, now: OffsetDateTime, stats: &mut ReconcileStats) {
        let queued = match self.metadata.list_queued(self.config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                stats.errors += 1;
                tracing::error!(error = %e, "Failed to list queued sessions");
                return;
            }
        };

        let mut owners: Vec<String> = Vec::new();
        for row in queued {
            if !owners.contains(&row.owner_id) {
                owners.push(row.owner_id);
            }
        }

        for owner_id in owners {
            match self.admission.promote_owner(&owner_id, now).await {
                Ok(promoted) => stats.promoted += promoted,
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(owner_id = %owner_id, error = %e, "Failed to promote queued sessions");
                }
            }
        }
    }

    async fn purge(&self, before: OffsetDateTime, stats: &mut ReconcileStats) {
        for _ in 0..self.config.max_batches {
            match self.metadata.purge_terminal(before, self.config.batch_size).await {
                Ok(purged) => {
                    stats.purged += purged;
                    SESSIONS_PURGED.inc_by(purged);
                    if purged < u64::from(self.config.batch_size) {
                        return;
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(error = %e, "Failed to purge terminal sessions");
                    return;
                }
            }
        }
    }

    /// Run cycles every `interval_secs` until `shutdown` is cancelled.
    ///
    /// A cycle in progress always finishes; cancellation is observed between cycles.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_secs = self.config.interval_secs,
                abandon_timeout_secs = self.config.abandon_timeout_secs,
                "Lifecycle reconciler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stats = self.run_cycle(OffsetDateTime::now_utc()).await;
                if stats.errors > 0 {
                    tracing::warn!(?stats, "Reconciliation cycle finished with errors");
                } else if stats.touched_anything() {
                    tracing::info!(?stats, "Reconciliation cycle finished");
                } else {
                    tracing::debug!("Reconciliation cycle found nothing to do");
                }
            }

            tracing::info!("Lifecycle reconciler stopped");
        })
    }
}
