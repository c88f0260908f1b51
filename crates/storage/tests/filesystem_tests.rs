mod common;

use bytes::Bytes;
use common::seeded_bytes;
use porter_storage::{FilesystemBackend, ObjectStore, StorageError};
use tempfile::TempDir;

async fn backend() -> (TempDir, FilesystemBackend) {
    let temp = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp.path().join("data")).await.unwrap();
    (temp, backend)
}

#[tokio::test]
async fn test_sequential_chunks_assemble_file() {
    let (_temp, store) = backend().await;
    let payload = seeded_bytes(7, 1000);

    store.create("staging/upload").await.unwrap();
    store
        .write_at("staging/upload", 0, payload.slice(..500))
        .await
        .unwrap();
    store
        .write_at("staging/upload", 500, payload.slice(500..))
        .await
        .unwrap();

    assert_eq!(store.size("staging/upload").await.unwrap(), 1000);
    assert_eq!(store.get("staging/upload").await.unwrap(), payload);
}

#[tokio::test]
async fn test_rewriting_a_chunk_is_harmless() {
    let (_temp, store) = backend().await;
    let payload = seeded_bytes(11, 600);

    store.create("staging/retry").await.unwrap();
    store
        .write_at("staging/retry", 0, payload.slice(..300))
        .await
        .unwrap();
    // The acknowledgment was lost and the client resends the same bytes.
    store
        .write_at("staging/retry", 0, payload.slice(..300))
        .await
        .unwrap();
    store
        .write_at("staging/retry", 300, payload.slice(300..))
        .await
        .unwrap();

    assert_eq!(store.get("staging/retry").await.unwrap(), payload);
}

#[tokio::test]
async fn test_write_past_end_is_rejected() {
    let (_temp, store) = backend().await;
    store.create("staging/gap").await.unwrap();

    let err = store
        .write_at("staging/gap", 10, Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Gap { offset: 10, size: 0, .. }));
    assert_eq!(store.size("staging/gap").await.unwrap(), 0);
}

#[tokio::test]
async fn test_create_truncates_existing_object() {
    let (_temp, store) = backend().await;
    store
        .write_at("staging/reuse", 0, Bytes::from_static(b"stale bytes"))
        .await
        .unwrap();
    store.create("staging/reuse").await.unwrap();
    assert_eq!(store.size("staging/reuse").await.unwrap(), 0);
}

#[tokio::test]
async fn test_rename_moves_to_permanent_key() {
    let (_temp, store) = backend().await;
    store
        .write_at("staging/done", 0, Bytes::from_static(b"final"))
        .await
        .unwrap();

    store
        .rename("staging/done", "resources/r1/done")
        .await
        .unwrap();

    assert!(!store.exists("staging/done").await.unwrap());
    assert_eq!(
        store.get("resources/r1/done").await.unwrap(),
        Bytes::from_static(b"final")
    );

    let err = store
        .rename("staging/done", "resources/r1/again")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (_temp, store) = backend().await;
    store.create("staging/gone").await.unwrap();
    store.delete("staging/gone").await.unwrap();
    store.delete("staging/gone").await.unwrap();
    assert!(!store.exists("staging/gone").await.unwrap());
    assert!(store.size("staging/gone").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_traversal_keys_are_rejected() {
    let (_temp, store) = backend().await;
    let err = store.create("../outside").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidKey(_)));
    let err = store
        .write_at("/abs/path", 0, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidKey(_)));
}
