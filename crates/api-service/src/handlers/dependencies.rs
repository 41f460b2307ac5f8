//! Peer dependency check handlers.
//!
//! Each handler probes one peer and reports the outcome. A failed probe is
//! a 500 with `{"ok": false, "error": "..."}`; the handler itself never
//! errors.

use crate::models::DependencyCheckResult;
use crate::routes::AppState;
use crate::services::PeerEndpoint;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /auth-check
///
/// ## Example Response
///
/// ```json
/// { "ok": true, "auth": { "status": "up" } }
/// ```
#[instrument(skip_all, name = "api.dependency.auth_check")]
pub async fn auth_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    check_peer(&state, &state.peers.auth).await
}

/// Handler for GET /image-check
///
/// ## Example Response
///
/// ```json
/// { "ok": false, "error": "Request failed with status code 503" }
/// ```
#[instrument(skip_all, name = "api.dependency.image_check")]
pub async fn image_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    check_peer(&state, &state.peers.image).await
}

async fn check_peer(state: &AppState, endpoint: &PeerEndpoint) -> (StatusCode, Json<Value>) {
    let result = state.peer_client.probe_endpoint(endpoint).await;
    (status_for(&result), Json(result.to_body(endpoint.name)))
}

fn status_for(result: &DependencyCheckResult) -> StatusCode {
    if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_for_probe_outcome() {
        assert_eq!(
            status_for(&DependencyCheckResult::Healthy(json!({}))),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&DependencyCheckResult::Unhealthy("down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
