//! HTTP API tests driven through the router with `oneshot`.

mod common;

use axum::http::StatusCode;
use bytes::Bytes;
use common::{TestServer, seeded_bytes};
use porter_core::config::QueuePolicy;
use serde_json::json;

#[tokio::test]
async fn test_health_needs_no_owner() {
    let server = TestServer::new().await;
    let (status, _, body) = server.json("GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_requests_without_owner_are_unauthorized() {
    let server = TestServer::new().await;
    let (status, _, body) = server
        .json(
            "POST",
            "/v1/uploads",
            None,
            Some(json!({"kind": "create_resource", "total_size": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _, _) = server.json("GET", "/v1/slots", Some("   "), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_returns_location_and_offset_headers() {
    let server = TestServer::new().await;
    let (status, headers, body) = server
        .json(
            "POST",
            "/v1/uploads",
            Some("alice"),
            Some(json!({
                "kind": "create_resource",
                "total_size": 1000,
                "metadata": {"title": "Holiday video"},
            })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    let upload_id = body["upload_id"].as_str().unwrap();
    assert_eq!(
        headers["location"].to_str().unwrap(),
        format!("/v1/uploads/{upload_id}")
    );
    assert_eq!(headers["upload-offset"], "0");
    assert_eq!(headers["upload-length"], "1000");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["offset"], 0);
}

#[tokio::test]
async fn test_invalid_create_is_bad_request() {
    let server = TestServer::new().await;
    let (status, _, body) = server
        .json(
            "POST",
            "/v1/uploads",
            Some("alice"),
            Some(json!({"kind": "update_resource", "total_size": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    let (status, _, _) = server
        .send(
            "POST",
            "/v1/uploads",
            Some("alice"),
            &[("content-type", "application/json".to_string())],
            Bytes::from_static(b"{not json"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_resume_and_complete_over_http() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 1000).await;
    let data = seeded_bytes(42, 1000);

    let (status, headers, body) = server
        .append("alice", &upload_id, 0, data.slice(0..400))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["upload-offset"], "400");
    assert_eq!(body["progress"], 40.0);
    assert_eq!(body["status"], "uploading");
    assert_eq!(body["ready_to_complete"], false);

    // Connection dropped: the client asks where to resume.
    let (status, headers, body) = server
        .send(
            "HEAD",
            &format!("/v1/uploads/{upload_id}"),
            Some("alice"),
            &[],
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers["upload-offset"], "400");
    assert_eq!(headers["upload-length"], "1000");
    assert_eq!(headers["upload-status"], "uploading");
    assert_eq!(headers["cache-control"], "no-store");

    let (status, _, body) = server
        .append("alice", &upload_id, 400, data.slice(400..1000))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready_to_complete"], true);

    let uri = format!("/v1/uploads/{upload_id}/complete");
    let (status, _, body) = server.json("POST", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["already_completed"], false);
    assert!(body["resource_id"].is_string());

    let (status, _, body) = server.json("POST", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_completed"], true);

    let (status, _, body) = server
        .json("GET", &format!("/v1/uploads/{upload_id}"), Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"], 100.0);
}

#[tokio::test]
async fn test_offset_mismatch_is_conflict_with_current_offset() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 100).await;
    server
        .append("alice", &upload_id, 0, seeded_bytes(1, 30))
        .await;

    let (status, headers, body) = server
        .append("alice", &upload_id, 50, seeded_bytes(2, 10))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "offset_mismatch");
    assert_eq!(headers["upload-offset"], "30");
}

#[tokio::test]
async fn test_append_requires_offset_header() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 10).await;
    let (status, _, _) = server
        .send(
            "PATCH",
            &format!("/v1/uploads/{upload_id}"),
            Some("alice"),
            &[],
            seeded_bytes(1, 10),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected() {
    let server = TestServer::with_config(|config| {
        config.server.max_chunk_size = 64;
    })
    .await;
    let upload_id = server.create_upload("alice", 1000).await;
    let (status, _, _) = server
        .append("alice", &upload_id, 0, seeded_bytes(1, 128))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_other_owner_gets_forbidden() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 10).await;
    let (status, _, body) = server
        .json("GET", &format!("/v1/uploads/{upload_id}"), Some("mallory"), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn test_unknown_or_malformed_id_is_not_found() {
    let server = TestServer::new().await;
    let (status, _, _) = server
        .json(
            "GET",
            &format!("/v1/uploads/{}", uuid::Uuid::new_v4()),
            Some("alice"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = server
        .json("GET", "/v1/uploads/not-a-uuid", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admission_denial_is_too_many_requests() {
    let server = TestServer::with_config(|config| {
        config.admission.max_concurrent_per_owner = 1;
    })
    .await;
    server.create_upload("alice", 10).await;

    let (status, _, body) = server.json("GET", "/v1/slots", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], false);
    assert_eq!(body["active"], 1);

    let (status, headers, body) = server
        .json(
            "POST",
            "/v1/uploads",
            Some("alice"),
            Some(json!({"kind": "create_resource", "total_size": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "queue_full");
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_queue_policy_creates_queued_session() {
    let server = TestServer::with_config(|config| {
        config.admission.max_concurrent_per_owner = 1;
        config.admission.queue_policy = QueuePolicy::Queue;
    })
    .await;
    server.create_upload("alice", 10).await;
    let (status, _, body) = server
        .json(
            "POST",
            "/v1/uploads",
            Some("alice"),
            Some(json!({"kind": "create_resource", "total_size": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn test_cancel_then_append_conflicts() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 10).await;
    let uri = format!("/v1/uploads/{upload_id}");

    let (status, _, body) = server.json("DELETE", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["already_terminal"], false);

    let (status, _, body) = server.json("DELETE", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_terminal"], true);

    let (status, _, body) = server
        .append("alice", &upload_id, 0, seeded_bytes(1, 10))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
}

#[tokio::test]
async fn test_storage_failure_is_service_unavailable() {
    let server = TestServer::new().await;
    let upload_id = server.create_upload("alice", 10).await;
    server.flaky.fail_writes(1);

    let (status, _, body) = server
        .append("alice", &upload_id, 0, seeded_bytes(1, 10))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "storage_write_failure");

    let (status, _, _) = server
        .append("alice", &upload_id, 0, seeded_bytes(1, 10))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_list_and_extend() {
    let server = TestServer::new().await;
    let first = server.create_upload("alice", 10).await;
    server.create_upload("alice", 20).await;
    server.create_upload("bob", 30).await;

    let (status, _, body) = server.json("GET", "/v1/uploads", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploads"].as_array().unwrap().len(), 2);

    let (status, _, body) = server
        .json("GET", "/v1/uploads?limit=1", Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uploads"].as_array().unwrap().len(), 1);

    let (status, _, body) = server
        .json(
            "POST",
            &format!("/v1/uploads/{first}/extend"),
            Some("alice"),
            Some(json!({"expires_in_secs": 7200})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upload_id"], first);
}

#[tokio::test]
async fn test_metrics_endpoint_toggles() {
    let server = TestServer::new().await;
    porter_server::metrics::register_metrics();
    let (status, _, body) = server
        .send("GET", "/metrics", None, &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("porter_"));

    let server = TestServer::with_config(|config| {
        config.server.metrics_enabled = false;
    })
    .await;
    let (status, _, _) = server
        .send("GET", "/metrics", None, &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
