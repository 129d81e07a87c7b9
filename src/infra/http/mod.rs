//! HTTP surface: `POST /render` and `GET /health`.

mod error;
mod handlers;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderName,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::orchestrator::RenderOrchestrator;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use middleware::{REQUEST_ID_HEADER, RequestContext};

/// Which tier served the response: `remote`, `local`, or `miss`.
pub const CACHE_HEADER: HeaderName = HeaderName::from_static("x-render-cache");
pub const FINGERPRINT_HEADER: HeaderName = HeaderName::from_static("x-render-fingerprint");

#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Arc<RenderOrchestrator>,
}

impl HttpState {
    pub fn new(orchestrator: Arc<RenderOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn build_router(state: HttpState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/render", post(handlers::render))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
