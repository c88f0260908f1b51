//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Header carrying the caller identity established by the upstream
    /// authentication layer.
    #[serde(default = "default_owner_header")]
    pub owner_header: String,
    /// Maximum body size of a single append, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_owner_header() -> String {
    "x-porter-owner".to_string()
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            owner_header: default_owner_header(),
            max_chunk_size: default_max_chunk_size(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Upload session limits and storage layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest declared size accepted at creation.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Session lifetime when the client does not ask for one.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Upper bound on any session lifetime, including extensions.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// Largest serialized metadata payload, in bytes.
    #[serde(default = "default_max_metadata_bytes")]
    pub max_metadata_bytes: usize,
    /// Key prefix for bytes of in-flight uploads.
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,
    /// Key prefix for files bound to resources.
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_max_ttl_secs() -> u64 {
    7 * 86400
}

fn default_max_metadata_bytes() -> usize {
    16 * 1024
}

fn default_staging_prefix() -> String {
    "staging".to_string()
}

fn default_resource_prefix() -> String {
    "resources".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_metadata_bytes: default_max_metadata_bytes(),
            staging_prefix: default_staging_prefix(),
            resource_prefix: default_resource_prefix(),
        }
    }
}

impl UploadConfig {
    /// Default lifetime as a Duration.
    pub fn default_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        Duration::seconds(i64::try_from(self.default_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Maximum lifetime as a Duration.
    pub fn max_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.max_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Resolve a requested lifetime against the configured default and cap.
    pub fn resolve_ttl(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_ttl_secs)
            .min(self.max_ttl_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

/// What happens to a create request when the owner has no free slot.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Fail with QueueFull; the client retries later.
    #[default]
    Reject,
    /// Record the session as Queued and promote it when a slot frees up.
    Queue,
}

/// Admission control limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Active sessions (queued, pending, uploading) allowed per owner.
    #[serde(default = "default_max_concurrent_per_owner")]
    pub max_concurrent_per_owner: u32,
    /// Active sessions allowed across all owners (default: unlimited).
    #[serde(default)]
    pub max_concurrent_global: Option<u32>,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    /// Queued sessions allowed per owner when queueing is enabled.
    #[serde(default = "default_max_queued_per_owner")]
    pub max_queued_per_owner: u32,
}

fn default_max_concurrent_per_owner() -> u32 {
    3
}

fn default_max_queued_per_owner() -> u32 {
    10
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_owner: default_max_concurrent_per_owner(),
            max_concurrent_global: None,
            queue_policy: QueuePolicy::default(),
            max_queued_per_owner: default_max_queued_per_owner(),
        }
    }
}

/// Background lifecycle reconciliation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Run the reconciler inside the server process (default: true).
    #[serde(default = "default_reconciler_enabled")]
    pub enabled: bool,
    /// Seconds between cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Inactivity after which a pending or uploading session is abandoned.
    #[serde(default = "default_abandon_timeout_secs")]
    pub abandon_timeout_secs: u64,
    /// Age after which an unfinished completion claim is released.
    #[serde(default = "default_link_timeout_secs")]
    pub link_timeout_secs: u64,
    /// Rows fetched per sweep query.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Maximum batches per sweep in one cycle.
    #[serde(default = "default_max_batches")]
    pub max_batches: u32,
    /// Delete terminal sessions this long after their last update (default: keep).
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

fn default_reconciler_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_abandon_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_link_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_batches() -> u32 {
    50
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconciler_enabled(),
            interval_secs: default_interval_secs(),
            abandon_timeout_secs: default_abandon_timeout_secs(),
            link_timeout_secs: default_link_timeout_secs(),
            batch_size: default_batch_size(),
            max_batches: default_max_batches(),
            retention_secs: None,
        }
    }
}

impl ReconcilerConfig {
    /// Get the cycle interval as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn abandon_timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.abandon_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.link_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs
            .map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single node deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds. Advisory only: slow queries are logged,
        /// SQLite cannot cancel them.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// WARNING: Prefer PORTER_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** The reconciler is not started automatically;
    /// tests drive cycles explicitly.
    pub fn for_testing() -> Self {
        Self {
            reconciler: ReconcilerConfig {
                enabled: false,
                ..ReconcilerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.owner_header.trim().is_empty() {
            return Err("server.owner_header cannot be empty".to_string());
        }
        if self.server.max_chunk_size == 0 {
            return Err("server.max_chunk_size must be greater than 0".to_string());
        }
        if self.server.max_chunk_size > usize::MAX as u64 {
            return Err(format!(
                "server.max_chunk_size {} exceeds addressable memory",
                self.server.max_chunk_size
            ));
        }
        if self.uploads.max_upload_size > i64::MAX as u64 {
            return Err(format!(
                "uploads.max_upload_size {} exceeds maximum value {}",
                self.uploads.max_upload_size,
                i64::MAX
            ));
        }
        if self.uploads.default_ttl_secs == 0 || self.uploads.max_ttl_secs == 0 {
            return Err("uploads TTLs must be greater than 0".to_string());
        }
        if self.uploads.default_ttl_secs > self.uploads.max_ttl_secs {
            return Err(format!(
                "uploads.default_ttl_secs {} exceeds uploads.max_ttl_secs {}",
                self.uploads.default_ttl_secs, self.uploads.max_ttl_secs
            ));
        }
        if self.uploads.staging_prefix == self.uploads.resource_prefix {
            return Err("uploads.staging_prefix and uploads.resource_prefix must differ".to_string());
        }
        if self.admission.max_concurrent_per_owner == 0 {
            return Err("admission.max_concurrent_per_owner must be greater than 0".to_string());
        }
        if self.admission.max_concurrent_global == Some(0) {
            return Err("admission.max_concurrent_global must be greater than 0".to_string());
        }
        // tokio::time::interval panics on a zero period
        if self.reconciler.interval_secs == 0 {
            return Err("reconciler.interval_secs cannot be 0".to_string());
        }
        if self.reconciler.batch_size == 0 {
            return Err("reconciler.batch_size must be greater than 0".to_string());
        }
        self.metadata.validate()
    }
}
