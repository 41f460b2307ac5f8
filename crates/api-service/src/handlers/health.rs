//! Health endpoints.
//!
//! - `GET /health` - Constant service identity, no dependency checks
//! - `GET /live` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (has startup completed?)
//!
//! `/health` never touches the database or peers, so it answers even while
//! they are down. Process-level database failure is the heartbeat's job.

use crate::models::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::instrument;

/// Readiness flag.
///
/// Liveness needs no state: a process that can answer `/live` is live, and
/// an unrecoverable database failure ends the process instead.
#[derive(Debug, Default)]
pub struct HealthState {
    ready: AtomicBool,
}

impl HealthState {
    /// Create a new health state (not ready).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Handler for GET /health
///
/// ## Example Response
///
/// ```json
/// {
///   "service": "api-service",
///   "status": "ok"
/// }
/// ```
#[instrument(skip_all, name = "api.health.check")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(&state.config.service_name))
}

/// Handler for GET /live
#[instrument(skip_all, name = "api.health.live")]
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "live")
}

/// Handler for GET /ready
///
/// Returns 503 until startup has completed and again once shutdown begins.
#[instrument(skip_all, name = "api.health.ready")]
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
