//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{OffsetAdvance, UploadSessionRow};
use crate::repos::UploadRepo;
use crate::repos::uploads::{
    ACTIVE_STATUSES_SQL, RUNNING_STATUSES_SQL, TERMINAL_STATUSES_SQL, check_transition,
    check_transition_or_same, not_applied,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use porter_core::UploadStatus;
use porter_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Split the schema into statements, skipping comment-only fragments.
fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password arrive separately (e.g. `PORTER_METADATA__PASSWORD`).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn session_exists(&self, upload_id: Uuid) -> MetadataResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM upload_sessions WHERE upload_id = $1)")
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

    async fn count_for_owner(&self, sql: &str, owner_id: &str) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold several commands.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                upload_id, owner_id, resource_id, kind, total_size, upload_offset,
                progress, storage_path, status, metadata, last_chunk_offset,
                last_chunk_size, last_chunk_digest, link_started_at, error_code,
                error_detail, trace_id, created_at, updated_at, expires_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                      $16, $17, $18, $19, $20, $21)
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
        sqlx::query_as::<_, UploadSessionRow>(
            "SELECT * FROM upload_sessions WHERE upload_id = $1",
        )
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
            "SELECT * FROM upload_sessions WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2",
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
            SET upload_offset = $1,
                progress = CASE WHEN total_size = 0 THEN 0.0
                                ELSE ($1::DOUBLE PRECISION * 100.0) / total_size END,
                status = $2,
                last_chunk_offset = $3,
                last_chunk_size = $4,
                last_chunk_digest = $5,
                updated_at = $6
            WHERE upload_id = $7 AND upload_offset = $8 AND status = $9 AND $1 <= total_size
            "#,
        )
        .bind(advance.new_offset)
        .bind(advance.new_status.as_str())
        .bind(advance.chunk_offset)
        .bind(advance.chunk_size)
        .bind(&advance.chunk_digest)
        .bind(advance.updated_at)
        .bind(advance.upload_id)
        .bind(advance.expected_offset)
        .bind(advance.expected_status.as_str())
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
            "UPDATE upload_sessions SET status = $1, updated_at = $2 \
             WHERE upload_id = $3 AND status = $4 AND link_started_at IS NULL",
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
            SET status = 'failed', error_code = $1, error_detail = $2,
                link_started_at = NULL, updated_at = $3
            WHERE upload_id = $4 AND status = $5
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
            SET link_started_at = $1, updated_at = $1
            WHERE upload_id = $2
              AND upload_offset = total_size
              AND (status = 'uploading' OR (status = 'pending' AND total_size = 0))
              AND (link_started_at IS NULL OR link_started_at < $3)
            "#,
        )
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
            "UPDATE upload_sessions SET link_started_at = NULL, updated_at = $1 \
             WHERE upload_id = $2 AND link_started_at = $3",
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
            SET status = 'completed', resource_id = $1, storage_path = $2, progress = 100.0,
                completed_at = $3, updated_at = $3, link_started_at = NULL
            WHERE upload_id = $4
              AND status IN ('pending', 'uploading')
              AND upload_offset = total_size
              AND link_started_at = $5
            "#,
        )
        .bind(resource_id)
        .bind(storage_path)
        .bind(completed_at)
        .bind(upload_id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn delete_session(&self, upload_id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = $1")
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
        let sql = format!(
            "SELECT * FROM upload_sessions \
             WHERE status IN {ACTIVE_STATUSES_SQL} AND expires_at < $1 AND link_started_at IS NULL \
             ORDER BY expires_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, UploadSessionRow>(&sql)
            .bind(as_of)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_abandoned(
        &self,
        stale_since: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>> {
        let sql = format!(
            "SELECT * FROM upload_sessions \
             WHERE status IN {RUNNING_STATUSES_SQL} AND updated_at < $1 AND link_started_at IS NULL \
             ORDER BY updated_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, UploadSessionRow>(&sql)
            .bind(stale_since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn expire_if_past_deadline(
        &self,
        upload_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let sql = format!(
            "UPDATE upload_sessions SET status = 'expired', updated_at = $1 \
             WHERE upload_id = $2 AND status IN {ACTIVE_STATUSES_SQL} \
               AND expires_at < $1 AND link_started_at IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(upload_id)
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
            "UPDATE upload_sessions SET status = 'expired', updated_at = $1 \
             WHERE upload_id = $2 AND status IN {RUNNING_STATUSES_SQL} \
               AND updated_at < $3 AND link_started_at IS NULL"
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
            "UPDATE upload_sessions SET link_started_at = NULL, updated_at = $1 \
             WHERE link_started_at IS NOT NULL AND link_started_at < $2 \
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
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = $1 AND status IN {ACTIVE_STATUSES_SQL}"
        );
        self.count_for_owner(&sql, owner_id).await
    }

    async fn count_running_by_owner(&self, owner_id: &str) -> MetadataResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = $1 AND status IN {RUNNING_STATUSES_SQL}"
        );
        self.count_for_owner(&sql, owner_id).await
    }

    async fn count_queued_by_owner(&self, owner_id: &str) -> MetadataResult<u64> {
        self.count_for_owner(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = $1 AND status = 'queued'",
            owner_id,
        )
        .await
    }

    async fn count_active(&self) -> MetadataResult<u64> {
        let sql =
            format!("SELECT COUNT(*) FROM upload_sessions WHERE status IN {ACTIVE_STATUSES_SQL}");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn list_active_by_owner(&self, owner_id: &str) -> MetadataResult<Vec<UploadSessionRow>> {
        let sql = format!(
            "SELECT * FROM upload_sessions WHERE owner_id = $1 AND status IN {ACTIVE_STATUSES_SQL} \
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
            "SELECT * FROM upload_sessions WHERE status = 'queued' ORDER BY created_at ASC LIMIT $1",
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
            "UPDATE upload_sessions SET expires_at = $1, updated_at = $2 \
             WHERE upload_id = $3 AND status IN {ACTIVE_STATUSES_SQL} AND expires_at < $1"
        );
        let result = sqlx::query(&sql)
            .bind(expires_at)
            .bind(updated_at)
            .bind(upload_id)
            .execute(&self.pool)
            .await?;

        self.applied_or_missing(result.rows_affected(), upload_id)
            .await
    }

    async fn purge_terminal(&self, before: OffsetDateTime, limit: u32) -> MetadataResult<u64> {
        let sql = format!(
            "DELETE FROM upload_sessions WHERE upload_id IN ( \
                SELECT upload_id FROM upload_sessions \
                WHERE status IN {TERMINAL_STATUSES_SQL} AND updated_at < $1 \
                ORDER BY updated_at ASC LIMIT $2)"
        );
        let result = sqlx::query(&sql)
            .bind(before)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_skip_comment_only_fragments() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS upload_sessions"));
        assert!(statements.iter().all(|s| !s.ends_with(';')));
        assert!(
            statements
                .iter()
                .any(|s| s.contains("upload_sessions(status, expires_at)"))
        );
    }
}
