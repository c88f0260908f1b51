//! Upload protocol handlers.

use crate::auth::{get_trace_id, require_owner};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use porter_core::upload::{
    AppendChunkResponse, CancelUploadResponse, CompleteUploadResponse, CreateUploadRequest,
    CreateUploadResponse, ExtendUploadRequest, ListUploadsResponse, SlotResponse,
    UploadStateResponse,
};
use porter_core::{
    UPLOAD_LENGTH_HEADER, UPLOAD_OFFSET_HEADER, UPLOAD_STATUS_HEADER, UploadId, UploadSession,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Body allowance for JSON requests on top of the metadata limit.
const JSON_BODY_OVERHEAD: usize = 4 * 1024;

/// Default and maximum page size for listing.
const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

fn parse_upload_id(upload_id: &str) -> ApiResult<UploadId> {
    UploadId::parse(upload_id).map_err(|_| ApiError::NotFound(format!("upload {upload_id}")))
}

async fn read_json<T: DeserializeOwned>(req: Request, limit: usize) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

fn header_value(value: impl ToString) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value.to_string())
        .map_err(|e| ApiError::Internal(format!("invalid header value: {e}")))
}

fn offset_headers(session: &UploadSession) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(UPLOAD_OFFSET_HEADER),
        HeaderValue::from(session.offset),
    );
    headers.insert(
        HeaderName::from_static(UPLOAD_LENGTH_HEADER),
        HeaderValue::from(session.total_size),
    );
    headers.insert(
        HeaderName::from_static(UPLOAD_STATUS_HEADER),
        header_value(session.status)?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(headers)
}

/// GET /v1/slots - Advisory admission check for the caller.
#[tracing::instrument(skip(state, req))]
pub async fn get_slots(State(state): State<AppState>, req: Request) -> ApiResult<Json<SlotResponse>> {
    let owner = require_owner(&req)?;
    let slot = state.protocol.request_slot(owner.as_str()).await?;
    Ok(Json(SlotResponse {
        available: slot.available,
        active: slot.active,
        queue_length: slot.queue_length,
        max_concurrent: slot.max_concurrent,
    }))
}

/// POST /v1/uploads - Create a new upload session.
#[tracing::instrument(skip(state, req))]
pub async fn create_upload(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, HeaderMap, Json<CreateUploadResponse>)> {
    let owner = require_owner(&req)?.clone();
    let trace_id = get_trace_id(&req).map(|t| t.0.clone());
    let limit = state.config.uploads.max_metadata_bytes + JSON_BODY_OVERHEAD;
    let body: CreateUploadRequest = read_json(req, limit).await?;

    let session = state
        .protocol
        .create(owner.as_str(), body, trace_id)
        .await?;

    let location = format!("/v1/uploads/{}", session.id);
    let mut headers = offset_headers(&session)?;
    headers.insert(header::LOCATION, header_value(&location)?);

    Ok((
        StatusCode::CREATED,
        headers,
        Json(CreateUploadResponse {
            upload_id: session.id.to_string(),
            location,
            storage_path: session.storage_path,
            offset: session.offset,
            status: session.status,
            expires_at: session.expires_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListUploadsQuery {
    pub limit: Option<u32>,
}

/// GET /v1/uploads - The caller's sessions, newest first.
#[tracing::instrument(skip(state, req))]
pub async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<ListUploadsQuery>,
    req: Request,
) -> ApiResult<Json<ListUploadsResponse>> {
    let owner = require_owner(&req)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let sessions = state.protocol.list(owner.as_str(), limit).await?;
    Ok(Json(ListUploadsResponse {
        uploads: sessions.iter().map(UploadStateResponse::from).collect(),
    }))
}

/// GET /v1/uploads/{upload_id} - Current state of a session.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<(HeaderMap, Json<UploadStateResponse>)> {
    let owner = require_owner(&req)?;
    let id = parse_upload_id(&upload_id)?;
    let session = state.protocol.query(owner.as_str(), id).await?;
    Ok((offset_headers(&session)?, Json(UploadStateResponse::from(&session))))
}

/// HEAD /v1/uploads/{upload_id} - Resumption probe: offset, length and status headers.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn head_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<(StatusCode, HeaderMap)> {
    let owner = require_owner(&req)?;
    let id = parse_upload_id(&upload_id)?;
    let session = state.protocol.query(owner.as_str(), id).await?;
    Ok((StatusCode::OK, offset_headers(&session)?))
}

/// PATCH /v1/uploads/{upload_id} - Append the body at the `Upload-Offset` header.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id, offset = tracing::field::Empty))]
pub async fn append_chunk(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<(HeaderMap, Json<AppendChunkResponse>)> {
    let owner = require_owner(&req)?.clone();
    let id = parse_upload_id(&upload_id)?;

    let chunk_offset: u64 = req
        .headers()
        .get(UPLOAD_OFFSET_HEADER)
        .ok_or_else(|| ApiError::BadRequest("missing Upload-Offset header".to_string()))?
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ApiError::BadRequest("invalid Upload-Offset header".to_string()))?;
    tracing::Span::current().record("offset", chunk_offset);

    let max_chunk_size = state.config.server.max_chunk_size;
    let declared_len = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_len.is_some_and(|len| len > max_chunk_size) {
        return Err(ApiError::PayloadTooLarge(format!(
            "chunk exceeds maximum size of {max_chunk_size} bytes"
        )));
    }

    let limit = usize::try_from(max_chunk_size).unwrap_or(usize::MAX);
    let data = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read chunk: {e}")))?;

    let outcome = state
        .protocol
        .append_chunk(owner.as_str(), id, chunk_offset, data)
        .await?;

    let ready_to_complete = outcome.ready_to_complete();
    let session = outcome.session;
    Ok((
        offset_headers(&session)?,
        Json(AppendChunkResponse {
            upload_id: session.id.to_string(),
            offset: session.offset,
            length: session.total_size,
            progress: session.progress(),
            status: session.status,
            ready_to_complete,
            replayed: outcome.replayed,
        }),
    ))
}

/// DELETE /v1/uploads/{upload_id} - Cancel a session.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CancelUploadResponse>> {
    let owner = require_owner(&req)?;
    let id = parse_upload_id(&upload_id)?;
    let outcome = state.protocol.cancel(owner.as_str(), id).await?;
    Ok(Json(CancelUploadResponse {
        upload_id: outcome.session.id.to_string(),
        status: outcome.session.status,
        already_terminal: outcome.already_terminal,
    }))
}

/// POST /v1/uploads/{upload_id}/complete - Link a fully received upload to its resource.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let owner = require_owner(&req)?;
    let id = parse_upload_id(&upload_id)?;
    let outcome = state.completion.complete(owner.as_str(), id).await?;
    let session = outcome.session;

    let resource_id = session.resource_id.ok_or_else(|| {
        ApiError::Internal(format!("completed upload {id} has no resource id"))
    })?;
    let completed_at = session.completed_at.ok_or_else(|| {
        ApiError::Internal(format!("completed upload {id} has no completion time"))
    })?;

    Ok(Json(CompleteUploadResponse {
        upload_id: session.id.to_string(),
        resource_id,
        storage_path: session.storage_path,
        status: session.status,
        completed_at,
        already_completed: outcome.already_completed,
    }))
}

/// POST /v1/uploads/{upload_id}/extend - Push the session deadline out.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id))]
pub async fn extend_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Json<UploadStateResponse>> {
    let owner = require_owner(&req)?.clone();
    let id = parse_upload_id(&upload_id)?;
    let body: ExtendUploadRequest = read_json(req, JSON_BODY_OVERHEAD).await?;
    let session = state
        .protocol
        .extend(owner.as_str(), id, body.expires_in_secs)
        .await?;
    Ok(Json(UploadStateResponse::from(&session)))
}
