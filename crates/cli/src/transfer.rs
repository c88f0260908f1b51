//! Resumable file transfer over the upload API.
//!
//! The server's offset is authoritative. On an offset mismatch the loop
//! continues from the offset the server reported; on a transport failure or
//! a retryable status it asks the server where to resume.

use crate::api_client::{ApiClient, RequestError};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use porter_core::upload::CompleteUploadResponse;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Consecutive failures tolerated before giving up.
pub const MAX_RETRIES: u32 = 5;

/// Default bytes per append.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub max_retries: u32,
    /// First retry delay, doubled on each further attempt.
    pub base_delay: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl TransferOptions {
    fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, len: usize) -> Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Send `path` to `upload_id` starting at `start_offset`. Returns the final offset.
pub async fn send_file(
    client: &ApiClient,
    upload_id: &str,
    path: &Path,
    start_offset: u64,
    options: TransferOptions,
) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let total = file.metadata().await?.len();
    let chunk_size = options.chunk_size.max(1) as u64;

    let mut offset = start_offset;
    let mut failures = 0;
    while offset < total {
        let len = usize::try_from(chunk_size.min(total - offset))
            .context("chunk size exceeds platform limits")?;
        let data = read_chunk(&mut file, offset, len).await?;

        match client.append_chunk(upload_id, offset, data).await {
            Ok(response) => {
                if response.offset <= offset && !response.replayed {
                    bail!("server did not advance past offset {offset}");
                }
                offset = response.offset;
                failures = 0;
                tracing::info!(upload_id, offset, total, progress = response.progress, "Chunk sent");
            }
            Err(RequestError::Api {
                code,
                offset: Some(server_offset),
                ..
            }) if code == "offset_mismatch" => {
                failures += 1;
                if failures > options.max_retries {
                    bail!("offset kept changing under the upload, last server offset {server_offset}");
                }
                tracing::warn!(upload_id, offset, server_offset, "Offset mismatch, resuming from server offset");
                offset = server_offset;
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                if failures > options.max_retries {
                    return Err(e).context("giving up after repeated failures");
                }
                let hint = match &e {
                    RequestError::Api { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = options.backoff(failures, hint);
                tracing::warn!(upload_id, error = %e, delay_ms = delay.as_millis() as u64, "Append failed, retrying");
                tokio::time::sleep(delay).await;
                offset = client
                    .probe_offset(upload_id)
                    .await
                    .context("failed to query the resume offset")?
                    .offset;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(offset)
}

/// Complete `upload_id`, retrying collaborator and transport failures.
pub async fn complete(
    client: &ApiClient,
    upload_id: &str,
    options: TransferOptions,
) -> Result<CompleteUploadResponse> {
    let mut attempt = 0;
    loop {
        match client.complete_upload(upload_id).await {
            Ok(response) => return Ok(response),
            Err(e) if (e.is_retryable() || e.code() == Some("link_in_progress"))
                && attempt < options.max_retries =>
            {
                attempt += 1;
                let delay = options.backoff(attempt, None);
                tracing::warn!(upload_id, error = %e, "Completion failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("failed to complete upload"),
        }
    }
}
