//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Byte sink for uploads.
///
/// Staged uploads are written with [`ObjectStore::write_at`] as chunks
/// arrive and moved to their permanent key with [`ObjectStore::rename`]
/// once complete.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an empty object, truncating any existing bytes.
    async fn create(&self, key: &str) -> StorageResult<()>;

    /// Durably write `data` starting at `offset`.
    ///
    /// `offset` may not be past the current end of the object. Rewriting
    /// bytes that are already present is allowed so a retried chunk can be
    /// written again.
    async fn write_at(&self, key: &str, offset: u64, data: Bytes) -> StorageResult<()>;

    /// Current size of an object in bytes.
    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Read a whole object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Move an object to a new key, replacing anything already there.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check that the backend is usable.
    async fn health_check(&self) -> StorageResult<()>;
}
