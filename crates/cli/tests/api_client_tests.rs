#[path = "../src/api_client.rs"]
#[allow(dead_code)] // Some methods are used by the binary but not by tests
mod api_client;

use api_client::{ApiClient, OffsetProbe, RequestError};
use bytes::Bytes;
use httpmock::Method::{DELETE, GET, HEAD, PATCH, POST};
use httpmock::MockServer;
use porter_core::upload::CreateUploadRequest;
use porter_core::{UploadKind, UploadMetadata, UploadStatus};
use serde_json::json;
use std::net::TcpListener;

const OWNER: &str = "alice";
const UPLOAD_ID: &str = "6c1f0a52-3d3e-4d8e-9d6b-2f6f9c1d5e11";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn state_body(offset: u64, status: &str) -> serde_json::Value {
    json!({
        "upload_id": UPLOAD_ID,
        "kind": "create_resource",
        "status": status,
        "offset": offset,
        "length": 100,
        "progress": offset as f64,
        "metadata": {},
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "expires_at": "2024-01-02T00:00:00Z"
    })
}

#[tokio::test]
async fn api_client_success_paths() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let client = ApiClient::new(&server.base_url(), OWNER).unwrap();

    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/uploads")
            .header("x-porter-owner", OWNER)
            .json_body(json!({
                "kind": "create_resource",
                "total_size": 100,
                "metadata": {"title": "Site plan"}
            }));
        then.status(201).json_body(json!({
            "upload_id": UPLOAD_ID,
            "location": format!("/v1/uploads/{UPLOAD_ID}"),
            "storage_path": format!("staging/{UPLOAD_ID}"),
            "offset": 0,
            "status": "pending",
            "expires_at": "2024-01-02T00:00:00Z"
        }));
    });

    let append = server.mock(|when, then| {
        when.method(PATCH)
            .path(format!("/v1/uploads/{UPLOAD_ID}"))
            .header("x-porter-owner", OWNER)
            .header("upload-offset", "0")
            .body("0123456789");
        then.status(200).json_body(json!({
            "upload_id": UPLOAD_ID,
            "offset": 10,
            "length": 100,
            "progress": 10.0,
            "status": "uploading",
            "ready_to_complete": false,
            "replayed": false
        }));
    });

    let get = server.mock(|when, then| {
        when.method(GET).path(format!("/v1/uploads/{UPLOAD_ID}"));
        then.status(200).json_body(state_body(10, "uploading"));
    });

    let head = server.mock(|when, then| {
        when.method(HEAD).path(format!("/v1/uploads/{UPLOAD_ID}"));
        then.status(200)
            .header("upload-offset", "10")
            .header("upload-length", "100")
            .header("upload-status", "uploading");
    });

    let slots = server.mock(|when, then| {
        when.method(GET).path("/v1/slots");
        then.status(200).json_body(json!({
            "available": true,
            "active": 1,
            "queue_length": 0,
            "max_concurrent": 3
        }));
    });

    let list = server.mock(|when, then| {
        when.method(GET).path("/v1/uploads").query_param("limit", "5");
        then.status(200)
            .json_body(json!({ "uploads": [state_body(10, "uploading")] }));
    });

    let cancel = server.mock(|when, then| {
        when.method(DELETE).path(format!("/v1/uploads/{UPLOAD_ID}"));
        then.status(200).json_body(json!({
            "upload_id": UPLOAD_ID,
            "status": "cancelled",
            "already_terminal": false
        }));
    });

    let mut metadata = UploadMetadata::new();
    metadata.insert("title".to_string(), "Site plan".into());
    let created = client
        .create_upload(&CreateUploadRequest {
            kind: UploadKind::CreateResource,
            total_size: 100,
            metadata,
            resource_id: None,
            expires_in_secs: None,
        })
        .await
        .unwrap();
    assert_eq!(created.upload_id, UPLOAD_ID);
    assert_eq!(created.status, UploadStatus::Pending);

    let appended = client
        .append_chunk(UPLOAD_ID, 0, Bytes::from_static(b"0123456789"))
        .await
        .unwrap();
    assert_eq!(appended.offset, 10);
    assert_eq!(appended.status, UploadStatus::Uploading);

    let state = client.get_upload(UPLOAD_ID).await.unwrap();
    assert_eq!(state.offset, 10);

    let probe = client.probe_offset(UPLOAD_ID).await.unwrap();
    assert_eq!(
        probe,
        OffsetProbe {
            offset: 10,
            length: 100,
            status: "uploading".to_string()
        }
    );

    let slot = client.slots().await.unwrap();
    assert!(slot.available);
    assert_eq!(slot.max_concurrent, 3);

    let listed = client.list_uploads(Some(5)).await.unwrap();
    assert_eq!(listed.uploads.len(), 1);

    let cancelled = client.cancel_upload(UPLOAD_ID).await.unwrap();
    assert_eq!(cancelled.status, UploadStatus::Cancelled);

    for mock in [&create, &append, &get, &head, &slots, &list, &cancel] {
        mock.assert();
    }
}

#[tokio::test]
async fn api_client_custom_owner_header() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/v1/slots").header("x-user", "bob");
        then.status(200).json_body(json!({
            "available": false,
            "active": 3,
            "queue_length": 1,
            "max_concurrent": 3
        }));
    });

    let client = ApiClient::new(&server.base_url(), "bob")
        .unwrap()
        .with_owner_header("x-user");
    let slot = client.slots().await.unwrap();
    assert!(!slot.available);
    mock.assert();
}

#[tokio::test]
async fn api_client_surfaces_offset_on_mismatch() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PATCH).path(format!("/v1/uploads/{UPLOAD_ID}"));
        then.status(409)
            .header("upload-offset", "40")
            .json_body(json!({
                "code": "offset_mismatch",
                "message": "offset mismatch: expected 40, got 0"
            }));
    });

    let client = ApiClient::new(&server.base_url(), OWNER).unwrap();
    let err = client
        .append_chunk(UPLOAD_ID, 0, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("offset_mismatch"));
    assert!(!err.is_retryable());
    let RequestError::Api { status, offset, .. } = err else {
        panic!("expected API error");
    };
    assert_eq!(status.as_u16(), 409);
    assert_eq!(offset, Some(40));
}

#[tokio::test]
async fn api_client_reports_retry_after_on_queue_full() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/uploads");
        then.status(429).header("retry-after", "5").json_body(json!({
            "code": "queue_full",
            "message": "no upload slot available"
        }));
    });

    let client = ApiClient::new(&server.base_url(), OWNER).unwrap();
    let err = client
        .create_upload(&CreateUploadRequest {
            kind: UploadKind::CreateResource,
            total_size: 1,
            metadata: UploadMetadata::new(),
            resource_id: None,
            expires_in_secs: None,
        })
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    let RequestError::Api { retry_after, .. } = err else {
        panic!("expected API error");
    };
    assert_eq!(retry_after, Some(std::time::Duration::from_secs(5)));
}

#[tokio::test]
async fn api_client_returns_error_body_on_failure() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(format!("/v1/uploads/{UPLOAD_ID}"));
        then.status(500).body("boom");
    });

    let client = ApiClient::new(&server.base_url(), OWNER).unwrap();
    let err = client.get_upload(UPLOAD_ID).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), Some("unknown"));
    assert!(err.to_string().contains("API error (500"));
    assert!(err.to_string().contains("boom"));
}
