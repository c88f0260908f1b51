//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{OffsetAdvance, UploadSessionRow};
use crate::repos::UploadRepo;
use crate::repos::uploads::{
    ACTIVE_STATUSES_SQL, RUNNING_STATUSES_SQL, TERMINAL_STATUSES_SQL, check_transition,
    check_transition_or_same, not_applied,
};
use async_trait::async_trait;
use porter_core::UploadStatus;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; conditional updates stay
            // linearizable per session without SQLITE_BUSY retries.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = query_timeout.as_secs(),
            "SQLite metadata store ready (query timeout is advisory)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn note_slow(&self, operation: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.query_timeout {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = self.query_timeout.as_millis() as u64,
                "SQLite query exceeded advisory timeout"
            );
        }
    }

    async fn session_exists(&self, upload_id: Uuid) -> MetadataResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM upload_sessions WHERE upload_id = ?)")
                .bind(upload_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn applied_or_missing(&self, rows: u64, upload_id: Uuid) -> MetadataResult<bool> {
        if rows > 0 {
            return Ok(true);
        }
        not_applied(self.session_exists(upload_id).await?, upload_id)
    }

    async fn count(&self, sql: &str, owner_id: Option<&str>) -> MetadataResult<u64> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        if let Some(owner_id) = owner_id {
            query = query.bind(owner_id);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                upload_id, owner_id, resource_id, kind, total_size, upload_offset,
                progress, storage_path, status, metadata, last_chunk_offset,
                last_chunk_size, last_chunk_digest, link_started_at, error_code,
                error_detail, trace_id, created_at, updated_at, expires_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.upload_id)
        .bind(&session.owner_id)
        .bind(&session.resource_id)
        .bind(&session.kind)
        .bind(session.total_size)
        .bind(session.upload_offset)
        .bind(session.progress)
        .bind(&session.storage_path)
        .bind(&session.status)
        .bind(&session.metadata)
        .bind(session.last_chunk_offset)
        .bind(session.last_chunk_size)
        .bind(&session.last_chunk_digest)
        .bind(session.link_started_at)
        .bind(&session.error_code)
        .bind(&session.error_detail)
        .bind(&session.trace_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                MetadataError::AlreadyExists(format!("upload session {}", session.upload_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<UploadSessionRow> {
        sqlx::query_as::<_, UploadSessionRow>("SELECT * FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::session_not_found(upload_id))
    }

    async fn list_sessions_by_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>> {
        let rows = sqlx::query_as::<_, UploadSessionRow>(
            "SELECT * FROM upload_sessions WHERE owner_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(owner_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_offset(&self, advance: &OffsetAdvance) -> MetadataResult<bool> {
        check_transition_or_same(advance.expected_status, advance.new_status)?;
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET upload_offset = ?,
                progress = CASE WHEN total_size = 0 THEN 0.0
                                ELSE (CAST(? AS REAL) * 100.0) / total_size END,
                status = ?,
                last_chunk_offset = ?,
                last_chunk_size = ?,
                last_chunk_digest = ?,
                updated_at = ?
            WHERE upload_id = ? AND upload_offset = ? AND status = ? AND ? <= total_size
            "#,
        )
        .bind(advance.new_offset)
        .bind(advance.new_offset)
        .bind(advance.new_status.as_str())
        .bind(advance.chunk_offset)
        .bind(advance.chunk_size)
        .bind(&advance.chunk_digest)
        .bind(advance.updated_at)
        .bind(advance.upload_id)
        .bind(advance.expected_offset)
        .bind(advance.expected_status.as_str())
        .bind(advance.new_offset)
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), advance.upload_id)
            .await
    }

    async fn update_status(
        &self,
        upload_id: Uuid,
        expected: UploadStatus,
        status: UploadStatus,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        check_transition(expected, status)?;
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? \
             WHERE upload_id = ? AND status = ? AND link_started_at IS NULL",
        )
        .bind(status.as_str())
        .bind(updated_at)
        .bind(upload_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn fail_session(
        &self,
        upload_id: Uuid,
        expected: UploadStatus,
        error_code: &str,
        error_detail: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        check_transition(expected, UploadStatus::Failed)?;
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = 'failed', error_code = ?, error_detail = ?,
                link_started_at = NULL, updated_at = ?
            WHERE upload_id = ? AND status = ?
            "#,
        )
        .bind(error_code)
        .bind(error_detail)
        .bind(updated_at)
        .bind(upload_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn begin_link(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET link_started_at = ?, updated_at = ?
            WHERE upload_id = ?
              AND upload_offset = total_size
              AND (status = 'uploading' OR (status = 'pending' AND total_size = 0))
              AND (link_started_at IS NULL OR link_started_at < ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(upload_id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn release_link(
        &self,
        upload_id: Uuid,
        claimed_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET link_started_at = NULL, updated_at = ? \
             WHERE upload_id = ? AND link_started_at = ?",
        )
        .bind(updated_at)
        .bind(upload_id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn complete_session(
        &self,
        upload_id: Uuid,
        claimed_at: OffsetDateTime,
        resource_id: &str,
        storage_path: &str,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = 'completed', resource_id = ?, storage_path = ?, progress = 100.0,
                completed_at = ?, updated_at = ?, link_started_at = NULL
            WHERE upload_id = ?
              AND status IN ('pending', 'uploading')
              AND upload_offset = total_size
              AND link_started_at = ?
            "#,
        )
        .bind(resource_id)
        .bind(storage_path)
        .bind(completed_at)
        .bind(completed_at)
        .bind(upload_id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::session_not_found(upload_id));
        }
        Ok(())
    }

    async fn list_expired(
        &self,
        as_of: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>> {
        let started = Instant::now();
        let sql = format!(
            "SELECT * FROM upload_sessions \
             WHERE status IN {ACTIVE_STATUSES_SQL} AND expires_at < ? AND link_started_at IS NULL \
             ORDER BY expires_at ASC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, UploadSessionRow>(&sql)
            .bind(as_of)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        self.note_slow("list_expired", started);
        Ok(rows)
    }

    async fn list_abandoned(
        &self,
        stale_since: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>> {
        let started = Instant::now();
        let sql = format!(
            "SELECT * FROM upload_sessions \
             WHERE status IN {RUNNING_STATUSES_SQL} AND updated_at < ? AND link_started_at IS NULL \
             ORDER BY updated_at ASC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, UploadSessionRow>(&sql)
            .bind(stale_since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        self.note_slow("list_abandoned", started);
        Ok(rows)
    }

    async fn expire_if_past_deadline(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let sql = format!(
            "UPDATE upload_sessions SET status = 'expired', updated_at = ? \
             WHERE upload_id = ? AND status IN {ACTIVE_STATUSES_SQL} \
               AND expires_at < ? AND link_started_at IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(upload_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn expire_if_idle(
        &self,
        upload_id: Uuid,
        stale_since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let sql = format!(
            "UPDATE upload_sessions SET status = 'expired', updated_at = ? \
             WHERE upload_id = ? AND status IN {RUNNING_STATUSES_SQL} \
               AND updated_at < ? AND link_started_at IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(upload_id)
            .bind(stale_since)
            .execute(&self.pool)
            .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn release_stale_links(
        &self,
        stale_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let sql = format!(
            "UPDATE upload_sessions SET link_started_at = NULL, updated_at = ? \
             WHERE link_started_at IS NOT NULL AND link_started_at < ? \
               AND status IN {RUNNING_STATUSES_SQL}"
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(stale_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_active_by_owner(&self, owner_id: &str) -> MetadataResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = ? AND status IN {ACTIVE_STATUSES_SQL}"
        );
        self.count(&sql, Some(owner_id)).await
    }

    async fn count_running_by_owner(&self, owner_id: &str) -> MetadataResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = ? AND status IN {RUNNING_STATUSES_SQL}"
        );
        self.count(&sql, Some(owner_id)).await
    }

    async fn count_queued_by_owner(&self, owner_id: &str) -> MetadataResult<u64> {
        self.count(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = ? AND status = 'queued'",
            Some(owner_id),
        )
        .await
    }

    async fn count_active(&self) -> MetadataResult<u64> {
        let sql =
            format!("SELECT COUNT(*) FROM upload_sessions WHERE status IN {ACTIVE_STATUSES_SQL}");
        self.count(&sql, None).await
    }

    async fn list_active_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<UploadSessionRow>> {
        let sql = format!(
            "SELECT * FROM upload_sessions WHERE owner_id = ? AND status IN {ACTIVE_STATUSES_SQL} \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, UploadSessionRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_queued(&self, limit: u32) -> MetadataResult<Vec<UploadSessionRow>> {
        let rows = sqlx::query_as::<_, UploadSessionRow>(
            "SELECT * FROM upload_sessions WHERE status = 'queued' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn extend_expiry(
        &self,
        upload_id: Uuid,
        expires_at: OffsetDateTime,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let sql = format!(
            "UPDATE upload_sessions SET expires_at = ?, updated_at = ? \
             WHERE upload_id = ? AND status IN {ACTIVE_STATUSES_SQL} AND expires_at < ?"
        );
        let result = sqlx::query(&sql)
            .bind(expires_at)
            .bind(updated_at)
            .bind(upload_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn purge_terminal(&self, before: OffsetDateTime, limit: u32) -> MetadataResult<u64> {
        let started = Instant::now();
        let sql = format!(
            "DELETE FROM upload_sessions WHERE upload_id IN ( \
                SELECT upload_id FROM upload_sessions \
                WHERE status IN {TERMINAL_STATUSES_SQL} AND updated_at < ? \
                ORDER BY updated_at ASC LIMIT ?)"
        );
        let result = sqlx::query(&sql)
            .bind(before)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        self.note_slow("purge_terminal", started);
        Ok(result.rows_affected())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    resource_id TEXT,
    kind TEXT NOT NULL CHECK (kind IN ('create_resource', 'update_resource')),
    total_size INTEGER NOT NULL CHECK (total_size >= 0),
    upload_offset INTEGER NOT NULL DEFAULT 0
        CHECK (upload_offset >= 0 AND upload_offset <= total_size),
    progress REAL NOT NULL DEFAULT 0,
    storage_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN (
        'queued', 'pending', 'uploading', 'completed', 'failed', 'cancelled', 'expired'
    )),
    metadata TEXT NOT NULL DEFAULT '{}',
    -- Last accepted chunk, for replay detection
    last_chunk_offset INTEGER,
    last_chunk_size INTEGER,
    last_chunk_digest TEXT,
    -- Completion claim
    link_started_at TEXT,
    error_code TEXT,
    error_detail TEXT,
    trace_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_expires ON upload_sessions(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_updated ON upload_sessions(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner_status ON upload_sessions(owner_id, status);
"#;
