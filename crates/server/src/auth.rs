//! Request context middleware: trace ids and caller identity.
//!
//! Authentication happens upstream. The caller's identity arrives in the
//! configured owner header and is trusted as is.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Maximum length of an owner identifier.
const MAX_OWNER_LEN: usize = 256;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value.
    /// The value is truncated to MAX_TRACE_ID_LEN characters and non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        // Count characters, not bytes, so multi-byte input cannot split a code point.
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    /// Get the trace ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the calling user, as established upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    /// Accept a header value as an owner id. Blank, oversized or
    /// non-printable values are refused.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value.len() <= MAX_OWNER_LEN
            && value.chars().all(|c| c.is_ascii_graphic());
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Extract trace ID from X-Trace-Id header or generate a new one.
fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Attach the trace id and owner to the request and run it in a `request` span.
pub async fn request_context_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    let owner = req
        .headers()
        .get(state.config.server.owner_header.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(Owner::from_header);
    let owner_str = owner.as_ref().map(|o| o.0.clone()).unwrap_or_default();
    if let Some(owner) = owner {
        req.extensions_mut().insert(owner);
    }

    next.run(req)
        .instrument(tracing::info_span!(
            "request",
            trace_id = %trace_id_str,
            owner_id = %owner_str
        ))
        .await
}

/// Require a caller identity.
pub fn require_owner(req: &Request) -> ApiResult<&Owner> {
    req.extensions()
        .get::<Owner>()
        .ok_or_else(|| ApiError::Unauthorized("missing caller identity".to_string()))
}

/// Get the trace ID from request extensions.
pub fn get_trace_id(req: &Request) -> Option<&TraceId> {
    req.extensions().get::<TraceId>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_is_sanitized_and_truncated() {
        assert_eq!(TraceId::from_client("abc\n\u{1b}[31mdef").as_str(), "abc[31mdef");
        assert_eq!(TraceId::from_client(&"x".repeat(500)).as_str().len(), MAX_TRACE_ID_LEN);
        // Nothing printable left: a fresh id is generated.
        assert_eq!(TraceId::from_client("\u{7}\u{7}").as_str().len(), 36);
    }

    #[test]
    fn owner_header_validation() {
        assert_eq!(Owner::from_header(" alice ").unwrap().as_str(), "alice");
        assert!(Owner::from_header("").is_none());
        assert!(Owner::from_header("two words").is_none());
        assert!(Owner::from_header(&"a".repeat(MAX_OWNER_LEN + 1)).is_none());
    }
}
