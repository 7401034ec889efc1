//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, broker and embedded worker wiring
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: `{"detail": ...}` error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/", get(routes::system::welcome))
        .route("/health", get(routes::system::health))
        .merge(routes::jobs_router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
