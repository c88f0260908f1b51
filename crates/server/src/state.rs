//! Application state shared across handlers.

use crate::resources::StorageResourceLinker;
use crate::sessions::{
    AdmissionController, CompletionLinker, Reconciler, ResourceLinker, SessionLocks,
    UploadProtocol,
};
use porter_core::config::AppConfig;
use porter_metadata::MetadataStore;
use porter_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub admission: Arc<AdmissionController>,
    pub protocol: Arc<UploadProtocol>,
    pub completion: Arc<CompletionLinker>,
}

impl AppState {
    /// Wire the session components around the given collaborators.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        linker: Arc<dyn ResourceLinker>,
    ) -> Self {
        let locks = SessionLocks::new();
        let admission = Arc::new(AdmissionController::new(
            metadata.clone(),
            config.admission.clone(),
        ));
        let protocol = Arc::new(UploadProtocol::new(
            metadata.clone(),
            storage.clone(),
            admission.clone(),
            locks.clone(),
            config.uploads.clone(),
        ));
        let completion = Arc::new(CompletionLinker::new(
            metadata.clone(),
            linker,
            locks,
            config.reconciler.link_timeout(),
        ));

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            admission,
            protocol,
            completion,
        }
    }

    /// State whose completed uploads are moved under the resource prefix of `storage`.
    pub fn with_storage_linker(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let linker = Arc::new(StorageResourceLinker::new(
            storage.clone(),
            config.uploads.resource_prefix.clone(),
        ));
        Self::new(config, storage, metadata, linker)
    }

    /// Build the lifecycle reconciler over this state's stores.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.metadata.clone(),
            self.storage.clone(),
            self.admission.clone(),
            self.config.reconciler.clone(),
        )
    }
}
