//! Peer service health probes.
//!
//! Issues a single GET against a peer's health path and normalizes the
//! outcome into a `DependencyCheckResult`. No retries and no circuit
//! breaking: this is a diagnostic probe, the caller surfaces the result as-is.
//!
//! # Error Messages
//!
//! Failures carry a human-readable description only:
//! - non-2xx: `Request failed with status code <code>`
//! - timeout: `timeout of <ms>ms exceeded`
//! - network: the client error followed by its source chain
//! - bad body: `Invalid JSON body: <reason>`

use crate::config::Config;
use crate::errors::ApiError;
use crate::models::DependencyCheckResult;
use reqwest::Client;
use serde_json::Value;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Health path exposed by the auth peer.
pub const AUTH_VERIFY_PATH: &str = "/verify";

/// Health path exposed by the image peer.
pub const IMAGE_INFO_PATH: &str = "/info";

/// Connect timeout for peer probes in seconds.
const PEER_CONNECT_TIMEOUT_SECS: u64 = 2;

/// A named peer and the health path to probe on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Key used for the payload in the response body (`auth`, `image`).
    pub name: &'static str,

    /// Base URL of the peer.
    pub base_url: String,

    /// Health path on the peer.
    pub path: &'static str,
}

/// The two peers this service reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerServices {
    pub auth: PeerEndpoint,
    pub image: PeerEndpoint,
}

impl PeerServices {
    /// Resolve peer endpoints from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth: PeerEndpoint {
                name: "auth",
                base_url: config.auth_service_url.clone(),
                path: AUTH_VERIFY_PATH,
            },
            image: PeerEndpoint {
                name: "image",
                base_url: config.image_service_url.clone(),
                path: IMAGE_INFO_PATH,
            },
        }
    }
}

/// HTTP client for peer health probes.
#[derive(Clone)]
pub struct PeerProbeClient {
    client: Client,
    timeout: Duration,
}

impl PeerProbeClient {
    /// Create a probe client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(PEER_CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|e| {
                error!(target: "api.services.peer_probe", error = %e, "Failed to build HTTP client");
                ApiError::Internal
            })?;

        Ok(Self { client, timeout })
    }

    /// Probe `path` on the peer at `base_url`.
    ///
    /// Never fails: every failure becomes `DependencyCheckResult::Unhealthy`.
    #[instrument(skip(self), name = "api.services.peer_probe")]
    pub async fn probe(&self, base_url: &str, path: &str) -> DependencyCheckResult {
        match self.fetch(base_url, path).await {
            Ok(payload) => {
                debug!(target: "api.services.peer_probe", base_url, path, "Peer probe succeeded");
                DependencyCheckResult::Healthy(payload)
            }
            Err(message) => {
                warn!(
                    target: "api.services.peer_probe",
                    base_url,
                    path,
                    error = %message,
                    "Peer probe failed"
                );
                DependencyCheckResult::Unhealthy(message)
            }
        }
    }

    /// Probe a configured peer endpoint.
    pub async fn probe_endpoint(&self, endpoint: &PeerEndpoint) -> DependencyCheckResult {
        self.probe(&endpoint.base_url, endpoint.path).await
    }

    /// GET the peer and decode its JSON body, or describe why that failed.
    async fn fetch(&self, base_url: &str, path: &str) -> Result<Value, String> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.describe(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "Request failed with status code {}",
                status.as_u16()
            ));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                self.describe(&e)
            } else {
                format!("Invalid JSON body: {}", root_cause(&e))
            }
        })
    }

    fn describe(&self, err: &reqwest::Error) -> String {
        if err.is_timeout() {
            return format!("timeout of {}ms exceeded", self.timeout.as_millis());
        }
        error_chain(err)
    }
}

/// Render an error and its sources as `outer: inner: root`.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

fn root_cause(err: &(dyn StdError + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}
