//! Route configuration.

use crate::auth::request_context_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Appends read their own body with the configured chunk limit.
    let body_limit = usize::try_from(state.config.server.max_chunk_size).unwrap_or(usize::MAX);

    let api_routes = Router::new()
        // Health check (no caller identity needed, for load balancers/k8s probes)
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/slots", get(handlers::get_slots))
        .route(
            "/v1/uploads",
            post(handlers::create_upload).get(handlers::list_uploads),
        )
        .route(
            "/v1/uploads/{upload_id}",
            get(handlers::get_upload)
                .head(handlers::head_upload)
                .patch(handlers::append_chunk)
                .delete(handlers::cancel_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/complete",
            post(handlers::complete_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/extend",
            post(handlers::extend_upload),
        );

    let mut router = Router::new().merge(api_routes);

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_context_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
