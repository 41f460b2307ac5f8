//! HTTP routes for the API service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers::{self, HealthState};
use crate::middleware::http_metrics_middleware;
use crate::observability::MetricsRegistry;
use crate::services::{DatabaseSession, PeerProbeClient, PeerServices};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout applied to every route.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Shared database session.
    pub session: Arc<dyn DatabaseSession>,

    /// HTTP client for peer probes.
    pub peer_client: PeerProbeClient,

    /// Peer endpoints resolved from configuration.
    pub peers: PeerServices,

    /// Request metrics.
    pub metrics: Arc<MetricsRegistry>,

    /// Readiness flag.
    pub health: Arc<HealthState>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health` - Constant service identity
/// - `/auth-check`, `/image-check` - Peer probes
/// - `/db-check` - Database probe
/// - `/metrics` - Prometheus scrape endpoint
/// - `/live`, `/ready` - Kubernetes probes
pub fn build_routes(state: Arc<AppState>) -> Router {
    let metrics = Arc::clone(&state.metrics);

    let routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/auth-check", get(handlers::auth_check))
        .route("/image-check", get(handlers::image_check))
        .route("/db-check", get(handlers::db_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/live", get(handlers::liveness))
        .route("/ready", get(handlers::readiness))
        .with_state(state);

    // Layer order (innermost first):
    // 1. CatchPanicLayer - Turn handler panics into 500s
    // 2. TimeoutLayer - Timeout the request
    // 3. Metrics middleware - Sees the final status of every request
    // 4. TraceLayer - Log request details
    routes
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn_with_state(
            metrics,
            http_metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}
