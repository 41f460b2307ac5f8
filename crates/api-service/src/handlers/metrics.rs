//! Prometheus metrics endpoint handler.
//!
//! # Security
//!
//! This endpoint is unauthenticated to allow Prometheus to scrape metrics.
//! Labels carry only method, route pattern and status code.

use crate::errors::ApiError;
use crate::observability::metrics::CONTENT_TYPE;
use crate::routes::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use tracing::error;

/// Handler for GET /metrics
///
/// Returns 200 OK with Prometheus text format:
/// ```text
/// # HELP http_requests_total Total number of HTTP requests
/// # TYPE http_requests_total counter
/// http_requests_total{method="GET",route="/health",status="200"} 42
/// ```
#[tracing::instrument(skip_all, name = "api.metrics.scrape")]
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(Body::from(state.metrics.render()))
        .map_err(|e| {
            error!(target: "api.metrics", error = %e, "Failed to build metrics response");
            ApiError::Internal
        })
}
