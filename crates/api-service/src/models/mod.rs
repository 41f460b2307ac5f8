//! API service models.
//!
//! Response bodies for the HTTP surface and the normalized probe results
//! they are built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Health check response.
///
/// Returned by the `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service name.
    pub service: String,

    /// Always "ok" while the process is serving.
    pub status: String,
}

impl HealthResponse {
    /// Build the constant healthy response for a service.
    pub fn ok(service: &str) -> Self {
        Self {
            service: service.to_string(),
            status: "ok".to_string(),
        }
    }
}

/// Outcome of probing one peer service.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyCheckResult {
    /// Peer answered 2xx with a JSON body.
    Healthy(Value),

    /// Peer was unreachable, timed out, answered non-2xx, or sent an unparseable body.
    Unhealthy(String),
}

impl DependencyCheckResult {
    /// Whether the probe succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, DependencyCheckResult::Healthy(_))
    }

    /// Render the response body, placing the payload under `key` on success.
    ///
    /// - success: `{"ok": true, "<key>": <payload>}`
    /// - failure: `{"ok": false, "error": "<message>"}`
    pub fn to_body(&self, key: &str) -> Value {
        let mut body = Map::new();
        match self {
            DependencyCheckResult::Healthy(payload) => {
                body.insert("ok".to_string(), Value::Bool(true));
                body.insert(key.to_string(), payload.clone());
            }
            DependencyCheckResult::Unhealthy(error) => {
                body.insert("ok".to_string(), Value::Bool(false));
                body.insert("error".to_string(), Value::String(error.clone()));
            }
        }
        Value::Object(body)
    }
}

/// Outcome of probing the database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseCheckResult {
    /// `SELECT NOW()` succeeded.
    Connected(DateTime<Utc>),

    /// The query failed; carries the driver's message.
    Disconnected(String),
}

impl DatabaseCheckResult {
    /// Whether the database answered.
    pub fn is_connected(&self) -> bool {
        matches!(self, DatabaseCheckResult::Connected(_))
    }
}

/// Response body for `/db-check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCheckResponse {
    /// Whether the database answered.
    pub connected: bool,

    /// Database server time (present when connected).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Failure description (present when disconnected).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<DatabaseCheckResult> for DbCheckResponse {
    fn from(result: DatabaseCheckResult) -> Self {
        match result {
            DatabaseCheckResult::Connected(time) => Self {
                connected: true,
                time: Some(time),
                error: None,
            },
            DatabaseCheckResult::Disconnected(error) => Self {
                connected: false,
                time: None,
                error: Some(error),
            },
        }
    }
}

/// One completed request, as seen by the instrumentation middleware.
///
/// Aggregated into the metrics registry and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// HTTP method.
    pub method: String,

    /// Matched route pattern (not the literal URL).
    pub route: String,

    /// Final response status code.
    pub status: u16,

    /// Elapsed time from request start to completion.
    pub duration: Duration,
}
