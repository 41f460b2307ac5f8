//! API service error types.
//!
//! Probe endpoints never surface these directly: peer and database failures
//! are folded into the probe result shapes. `ApiError` covers the remaining
//! failures (startup, metrics setup, internal faults) and maps them to HTTP
//! status codes via the `IntoResponse` impl.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// API service error type.
///
/// Every variant maps to 500 Internal Server Error; details are logged,
/// never returned.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Database(err) => {
                tracing::error!(target: "api.database", error = %err, "Database operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            ApiError::Metrics(_) | ApiError::Internal => {
                tracing::error!(target: "api.internal", error = %self, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// Convert sqlx errors to ApiError
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}
