//! Database check handler.

use crate::models::DbCheckResponse;
use crate::routes::AppState;
use crate::services::probe_database;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /db-check
///
/// Runs `SELECT NOW()` on the shared session. There is no handler-level
/// timeout beyond the router's request timeout and the session's
/// `statement_timeout`.
///
/// ## Example Response
///
/// ```json
/// { "connected": true, "time": "2026-10-19T12:00:00Z" }
/// ```
#[instrument(skip_all, name = "api.database.check")]
pub async fn db_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<DbCheckResponse>) {
    let result = probe_database(state.session.as_ref()).await;

    let status = if result.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(DbCheckResponse::from(result)))
}
