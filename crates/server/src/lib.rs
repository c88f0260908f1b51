//! HTTP service for resumable upload sessions.
//!
//! This crate provides:
//! - Admission control per owner
//! - The offset-based append protocol
//! - Completion linking to domain resources
//! - The background lifecycle reconciler
//! - Prometheus metrics

pub mod auth;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod resources;
pub mod routes;
pub mod sessions;
pub mod state;

pub use auth::{Owner, TraceId};
pub use error::ApiError;
pub use resources::StorageResourceLinker;
pub use routes::create_router;
pub use state::AppState;
