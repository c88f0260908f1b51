//! Prometheus metrics for the porter server.
//!
//! Exposes counters for session lifecycle transitions, chunk traffic and
//! reconciliation, plus latency histograms for appends and completions.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no owner or upload identifiers, only aggregate counts.
//! Restrict the endpoint to scraper addresses at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

// Session lifecycle
pub static SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
});

pub static SESSIONS_QUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_queued_total",
        "Total number of upload sessions created in the queue",
    )
});

pub static SESSIONS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_rejected_total",
        "Total number of create requests denied by admission control",
    )
});

pub static SESSIONS_PROMOTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_promoted_total",
        "Total number of queued sessions promoted to pending",
    )
});

pub static SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_completed_total",
        "Total number of upload sessions linked to a resource",
    )
});

pub static SESSIONS_CANCELLED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_cancelled_total",
        "Total number of upload sessions cancelled by clients",
    )
});

pub static SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_expired_total",
        "Total number of upload sessions expired at their deadline",
    )
});

pub static SESSIONS_ABANDONED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_abandoned_total",
        "Total number of upload sessions expired for inactivity",
    )
});

pub static SESSIONS_PURGED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_upload_sessions_purged_total",
        "Total number of terminal sessions deleted after retention",
    )
});

// Chunk traffic
pub static CHUNKS_APPENDED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_chunks_appended_total",
        "Total number of chunks accepted",
    )
});

pub static CHUNK_REPLAYS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_chunk_replays_total",
        "Total number of retried chunks acknowledged without rewriting",
    )
});

pub static OFFSET_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_offset_mismatches_total",
        "Total number of chunks rejected for starting at the wrong offset",
    )
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_bytes_received_total",
        "Total bytes durably written for accepted chunks",
    )
});

// Failures
pub static STORAGE_WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_storage_write_failures_total",
        "Total number of chunk writes the object store failed",
    )
});

pub static LINK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_link_failures_total",
        "Total number of resource collaborator failures during completion",
    )
});

pub static LINKS_RELEASED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_stale_links_released_total",
        "Total number of completion claims released after timing out",
    )
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "porter_upload_errors_total",
            "Total upload request errors by error type",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

// Timing
pub static APPEND_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "porter_append_duration_seconds",
            "Time taken to accept a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static COMPLETION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "porter_completion_duration_seconds",
            "Time taken to link a completed upload to its resource",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Reconciler
pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "porter_reconcile_cycle_duration_seconds",
            "Time taken by one reconciliation cycle",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "porter_reconcile_errors_total",
        "Total number of per-session failures during reconciliation",
    )
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SESSIONS_CREATED.clone()),
            Box::new(SESSIONS_QUEUED.clone()),
            Box::new(SESSIONS_REJECTED.clone()),
            Box::new(SESSIONS_PROMOTED.clone()),
            Box::new(SESSIONS_COMPLETED.clone()),
            Box::new(SESSIONS_CANCELLED.clone()),
            Box::new(SESSIONS_EXPIRED.clone()),
            Box::new(SESSIONS_ABANDONED.clone()),
            Box::new(SESSIONS_PURGED.clone()),
            Box::new(CHUNKS_APPENDED.clone()),
            Box::new(CHUNK_REPLAYS.clone()),
            Box::new(OFFSET_MISMATCHES.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(STORAGE_WRITE_FAILURES.clone()),
            Box::new(LINK_FAILURES.clone()),
            Box::new(LINKS_RELEASED.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(APPEND_DURATION.clone()),
            Box::new(COMPLETION_DURATION.clone()),
            Box::new(RECONCILE_DURATION.clone()),
            Box::new(RECONCILE_ERRORS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by type.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}
