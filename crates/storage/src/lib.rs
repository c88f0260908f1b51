//! Byte storage for porter uploads.
//!
//! Provides the [`ObjectStore`] sink that accepts "write at offset" calls
//! for staged uploads and moves finished files to their permanent location.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::ObjectStore;

use porter_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store.create("staging/a").await.unwrap();
        store
            .write_at("staging/a", 0, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(store.size("staging/a").await.unwrap(), 2);
        store.health_check().await.unwrap();
    }
}
