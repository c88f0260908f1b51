//! Test fixtures for generating test data.

use bytes::Bytes;
use porter_core::{UploadId, UploadKind, UploadMetadata, UploadSession, UploadStatus};
use porter_metadata::models::UploadSessionRow;
use time::{Duration, OffsetDateTime};

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// A session for `owner` with everything else at plausible defaults.
#[allow(dead_code)]
pub fn test_session(owner: &str, total_size: u64, status: UploadStatus) -> UploadSession {
    let now = OffsetDateTime::now_utc();
    let id = UploadId::new();
    let mut metadata = UploadMetadata::new();
    metadata.insert("title".to_string(), "Quarterly report".into());
    UploadSession {
        id,
        owner_id: owner.to_string(),
        resource_id: None,
        kind: UploadKind::CreateResource,
        total_size,
        offset: 0,
        storage_path: format!("staging/{id}"),
        status,
        metadata,
        last_chunk: None,
        link_started_at: None,
        error_code: None,
        error_detail: None,
        created_at: now,
        updated_at: now,
        expires_at: now + Duration::hours(1),
        completed_at: None,
    }
}

/// Row for [`test_session`], ready to insert.
#[allow(dead_code)]
pub fn test_session_row(owner: &str, total_size: u64, status: UploadStatus) -> UploadSessionRow {
    UploadSessionRow::from_session(&test_session(owner, total_size, status), None)
        .expect("valid session row")
}
