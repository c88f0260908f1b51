use bytes::Bytes;
use porter_core::upload::{
    AppendChunkResponse, CancelUploadResponse, CompleteUploadResponse, CreateUploadRequest,
    CreateUploadResponse, ExtendUploadRequest, ListUploadsResponse, SlotResponse,
    UploadStateResponse,
};
use porter_core::{UPLOAD_LENGTH_HEADER, UPLOAD_OFFSET_HEADER, UPLOAD_STATUS_HEADER};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, de::DeserializeOwned};
use std::time::Duration;

/// Header the server reads the caller's identity from unless configured otherwise.
pub const DEFAULT_OWNER_HEADER: &str = "x-porter-owner";

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("API error ({status}) {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
        /// Current offset the server reported alongside the error.
        offset: Option<u64>,
        retry_after: Option<Duration>,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid server URL: {0}")]
    Url(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// Error code reported by the server, if the request reached it.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Transport(_) => true,
            Self::Url(_) | Self::InvalidResponse(_) => false,
        }
    }
}

pub type RequestResult<T> = Result<T, RequestError>;

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// What a HEAD probe reports about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetProbe {
    pub offset: u64,
    pub length: u64,
    pub status: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    owner: String,
    owner_header: String,
}

impl ApiClient {
    pub fn new(base_url: &str, owner: &str) -> RequestResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| RequestError::Url(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            owner: owner.to_string(),
            owner_header: DEFAULT_OWNER_HEADER.to_string(),
        })
    }

    pub fn with_owner_header(mut self, header: &str) -> Self {
        self.owner_header = header.to_string();
        self
    }

    fn url(&self, path: &str) -> RequestResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RequestError::Url(e.to_string()))
    }

    fn upload_url(&self, upload_id: &str) -> RequestResult<Url> {
        self.url(&format!("/v1/uploads/{upload_id}"))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> RequestResult<reqwest::Response> {
        let response = req
            .header(self.owner_header.as_str(), self.owner.as_str())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let offset = header_u64(response.headers(), UPLOAD_OFFSET_HEADER);
        let retry_after = header_u64(response.headers(), reqwest::header::RETRY_AFTER.as_str())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => (err.code, err.message),
            Err(_) => ("unknown".to_string(), body),
        };
        Err(RequestError::Api {
            status,
            code,
            message,
            offset,
            retry_after,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> RequestResult<T> {
        let response = self.send(req).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RequestError::InvalidResponse(e.to_string()))
    }

    pub async fn create_upload(&self, req: &CreateUploadRequest) -> RequestResult<CreateUploadResponse> {
        let url = self.url("/v1/uploads")?;
        self.send_json(self.http.post(url).json(req)).await
    }

    pub async fn append_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        data: Bytes,
    ) -> RequestResult<AppendChunkResponse> {
        let url = self.upload_url(upload_id)?;
        let req = self
            .http
            .patch(url)
            .header(UPLOAD_OFFSET_HEADER, offset)
            .header(reqwest::header::CONTENT_TYPE, "application/offset+octet-stream")
            .body(data);
        self.send_json(req).await
    }

    pub async fn get_upload(&self, upload_id: &str) -> RequestResult<UploadStateResponse> {
        let url = self.upload_url(upload_id)?;
        self.send_json(self.http.get(url)).await
    }

    /// Ask where to resume without fetching the full state.
    pub async fn probe_offset(&self, upload_id: &str) -> RequestResult<OffsetProbe> {
        let url = self.upload_url(upload_id)?;
        let response = self.send(self.http.head(url)).await?;
        let headers = response.headers();
        let offset = header_u64(headers, UPLOAD_OFFSET_HEADER).ok_or_else(|| {
            RequestError::InvalidResponse("missing Upload-Offset header".to_string())
        })?;
        let length = header_u64(headers, UPLOAD_LENGTH_HEADER).ok_or_else(|| {
            RequestError::InvalidResponse("missing Upload-Length header".to_string())
        })?;
        let status = headers
            .get(UPLOAD_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(OffsetProbe {
            offset,
            length,
            status,
        })
    }

    pub async fn cancel_upload(&self, upload_id: &str) -> RequestResult<CancelUploadResponse> {
        let url = self.upload_url(upload_id)?;
        self.send_json(self.http.delete(url)).await
    }

    pub async fn complete_upload(&self, upload_id: &str) -> RequestResult<CompleteUploadResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/complete"))?;
        self.send_json(self.http.post(url)).await
    }

    pub async fn extend_upload(
        &self,
        upload_id: &str,
        expires_in_secs: u64,
    ) -> RequestResult<UploadStateResponse> {
        let url = self.url(&format!("/v1/uploads/{upload_id}/extend"))?;
        let body = ExtendUploadRequest { expires_in_secs };
        self.send_json(self.http.post(url).json(&body)).await
    }

    pub async fn slots(&self) -> RequestResult<SlotResponse> {
        let url = self.url("/v1/slots")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn list_uploads(&self, limit: Option<u32>) -> RequestResult<ListUploadsResponse> {
        let mut url = self.url("/v1/uploads")?;
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        self.send_json(self.http.get(url)).await
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
