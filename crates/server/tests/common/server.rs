//! Server test utilities.

use super::linker::RecordingLinker;
use super::storage::FlakyStore;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use porter_core::config::{AppConfig, MetadataConfig, StorageConfig};
use porter_metadata::{MetadataStore, SqliteStore};
use porter_server::sessions::ResourceLinker;
use porter_server::{AppState, create_router};
use porter_storage::{FilesystemBackend, ObjectStore};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Header the test config reads the owner from.
#[allow(dead_code)]
pub const OWNER_HEADER: &str = "x-porter-owner";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub linker: Arc<RecordingLinker>,
    pub flaky: Arc<FlakyStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let backend: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );
        let flaky = Arc::new(FlakyStore::new(backend));

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.server.owner_header = OWNER_HEADER.to_string();
        config.storage = StorageConfig::Filesystem {
            path: storage_path,
        };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };

        // Apply user modifications
        modifier(&mut config);

        let linker = Arc::new(RecordingLinker::new());
        let state = AppState::new(
            config,
            flaky.clone(),
            metadata,
            linker.clone() as Arc<dyn ResourceLinker>,
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            linker,
            flaky,
            _temp_dir: temp_dir,
        }
    }

    /// A second server instance over the same metadata, storage and linker
    /// but with its own session locks, like another process would have.
    pub fn peer_state(&self) -> AppState {
        AppState::new(
            (*self.state.config).clone(),
            self.flaky.clone(),
            self.state.metadata.clone(),
            self.linker.clone() as Arc<dyn ResourceLinker>,
        )
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Get access to the underlying storage.
    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.state.storage.clone()
    }

    /// A second pool on the server's database file, for backdating rows.
    pub async fn sqlite_pool(&self) -> sqlx::SqlitePool {
        let MetadataConfig::Sqlite { path, .. } = &self.state.config.metadata else {
            panic!("test server uses sqlite");
        };
        let options = sqlx::sqlite::SqliteConnectOptions::new().filename(path);
        sqlx::SqlitePool::connect_with(options).await.unwrap()
    }

    /// Set a timestamp column of one session.
    pub async fn set_time(&self, upload_id: uuid::Uuid, column: &str, value: time::OffsetDateTime) {
        sqlx::query(&format!(
            "UPDATE upload_sessions SET {column} = ? WHERE upload_id = ?"
        ))
        .bind(value)
        .bind(upload_id)
        .execute(&self.sqlite_pool().await)
        .await
        .unwrap();
    }

    /// Send a request as `owner` and return status, headers and body bytes.
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        owner: Option<&str>,
        headers: &[(&str, String)],
        body: Bytes,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        let request = builder.body(Body::from(body)).unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    /// Send a JSON request as `owner` and parse the JSON response.
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        owner: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let (headers, bytes) = match body {
            Some(value) => (
                vec![("content-type", "application/json".to_string())],
                Bytes::from(serde_json::to_vec(&value).unwrap()),
            ),
            None => (Vec::new(), Bytes::new()),
        };
        let (status, headers, bytes) = self.send(method, uri, owner, &headers, bytes).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, json)
    }

    /// Create an upload through the API and return its id.
    pub async fn create_upload(&self, owner: &str, total_size: u64) -> String {
        let (status, _, json) = self
            .json(
                "POST",
                "/v1/uploads",
                Some(owner),
                Some(serde_json::json!({
                    "kind": "create_resource",
                    "total_size": total_size,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {json}");
        json["upload_id"].as_str().unwrap().to_string()
    }

    /// Append a chunk through the API.
    pub async fn append(
        &self,
        owner: &str,
        upload_id: &str,
        offset: u64,
        data: Bytes,
    ) -> (StatusCode, HeaderMap, Value) {
        let (status, headers, bytes) = self
            .send(
                "PATCH",
                &format!("/v1/uploads/{upload_id}"),
                Some(owner),
                &[
                    ("upload-offset", offset.to_string()),
                    ("content-length", data.len().to_string()),
                    ("content-type", "application/offset+octet-stream".to_string()),
                ],
                data,
            )
            .await;
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, json)
    }
}
