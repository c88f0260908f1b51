//! Default resource collaborator backed by the object store.
//!
//! Completed files are moved from staging to
//! `{resource_prefix}/{resource_id}/{upload_id}`. Resource ids for new
//! resources are derived from the upload id, so a retry after a lost
//! acknowledgment lands on the same key.

use crate::sessions::{LinkError, LinkRequest, LinkedResource, ResourceLinker};
use async_trait::async_trait;
use porter_core::upload::validate_resource_id;
use porter_storage::{ObjectStore, StorageError};
use std::sync::Arc;

/// Moves staged files into their permanent location.
pub struct StorageResourceLinker {
    storage: Arc<dyn ObjectStore>,
    resource_prefix: String,
}

impl StorageResourceLinker {
    pub fn new(storage: Arc<dyn ObjectStore>, resource_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            resource_prefix: resource_prefix.into(),
        }
    }

    fn final_key(&self, resource_id: &str, req: &LinkRequest) -> String {
        format!("{}/{}/{}", self.resource_prefix, resource_id, req.upload_id)
    }

    async fn move_into(
        &self,
        resource_id: &str,
        req: &LinkRequest,
    ) -> Result<LinkedResource, LinkError> {
        let target = self.final_key(resource_id, req);
        let linked = LinkedResource {
            resource_id: resource_id.to_string(),
            storage_path: target.clone(),
        };
        if req.storage_path == target {
            return Ok(linked);
        }

        match self.storage.rename(&req.storage_path, &target).await {
            Ok(()) => Ok(linked),
            Err(e) if e.is_not_found() => match self.storage.exists(&target).await {
                // Moved by an earlier attempt whose completion was never recorded.
                Ok(true) => Ok(linked),
                Ok(false) => Err(LinkError::Rejected(format!(
                    "staged file {} is missing",
                    req.storage_path
                ))),
                Err(e) => Err(LinkError::Transient(e.to_string())),
            },
            Err(StorageError::InvalidKey(reason)) => Err(LinkError::Rejected(reason)),
            Err(e) => Err(LinkError::Transient(e.to_string())),
        }
    }
}

#[async_trait]
impl ResourceLinker for StorageResourceLinker {
    async fn create_resource(&self, req: &LinkRequest) -> Result<LinkedResource, LinkError> {
        let resource_id = req.upload_id.to_string();
        self.move_into(&resource_id, req).await
    }

    async fn update_resource(
        &self,
        resource_id: &str,
        req: &LinkRequest,
    ) -> Result<LinkedResource, LinkError> {
        validate_resource_id(resource_id).map_err(|e| LinkError::Rejected(e.to_string()))?;
        self.move_into(resource_id, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use porter_core::{UploadId, UploadKind, UploadMetadata};
    use porter_storage::FilesystemBackend;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn ObjectStore>, StorageResourceLinker) {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let linker = StorageResourceLinker::new(storage.clone(), "resources");
        (temp, storage, linker)
    }

    fn request(kind: UploadKind, resource_id: Option<&str>) -> LinkRequest {
        let upload_id = UploadId::new();
        LinkRequest {
            upload_id,
            owner_id: "alice".to_string(),
            kind,
            resource_id: resource_id.map(str::to_string),
            storage_path: format!("staging/{upload_id}"),
            metadata: UploadMetadata::new(),
        }
    }

    #[tokio::test]
    async fn create_moves_file_and_is_retry_safe() {
        let (_temp, storage, linker) = setup().await;
        let req = request(UploadKind::CreateResource, None);
        storage
            .write_at(&req.storage_path, 0, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let first = linker.create_resource(&req).await.unwrap();
        assert_eq!(first.resource_id, req.upload_id.to_string());
        assert_eq!(
            first.storage_path,
            format!("resources/{}/{}", req.upload_id, req.upload_id)
        );
        assert!(!storage.exists(&req.storage_path).await.unwrap());

        let again = linker.create_resource(&req).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(
            storage.get(&first.storage_path).await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn update_rejects_unsafe_resource_ids() {
        let (_temp, storage, linker) = setup().await;
        let req = request(UploadKind::UpdateResource, Some("../etc"));
        storage.create(&req.storage_path).await.unwrap();

        let err = linker.update_resource("../etc", &req).await.unwrap_err();
        assert!(matches!(err, LinkError::Rejected(_)));
        assert!(storage.exists(&req.storage_path).await.unwrap());

        let linked = linker.update_resource("doc-42", &req).await.unwrap();
        assert_eq!(linked.resource_id, "doc-42");
    }

    #[tokio::test]
    async fn missing_staged_file_is_rejected() {
        let (_temp, _storage, linker) = setup().await;
        let req = request(UploadKind::CreateResource, None);
        let err = linker.create_resource(&req).await.unwrap_err();
        assert!(matches!(err, LinkError::Rejected(_)));
    }
}
