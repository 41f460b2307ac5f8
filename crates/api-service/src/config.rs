//! API service configuration.
//!
//! Configuration is loaded from environment variables. The database
//! password is held as a secret and redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default service name reported by `/health`.
pub const DEFAULT_SERVICE_NAME: &str = "api-service";

/// Default PostgreSQL port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default auth peer base URL.
pub const DEFAULT_AUTH_SERVICE_URL: &str = "http://auth-service.auth-service";

/// Default image peer base URL.
pub const DEFAULT_IMAGE_SERVICE_URL: &str = "http://image-service.image-service";

/// Default timeout for a single peer probe in seconds.
pub const DEFAULT_PEER_TIMEOUT_SECONDS: u64 = 5;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 5;

/// Upper bound for the heartbeat interval in seconds.
pub const MAX_HEARTBEAT_INTERVAL_SECONDS: u64 = 3600;

/// Default heartbeat probe timeout in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 3000;

/// Default server-side statement timeout in seconds.
pub const DEFAULT_DB_STATEMENT_TIMEOUT_SECONDS: u64 = 5;

/// Default drain period after a shutdown signal.
pub const DEFAULT_SHUTDOWN_DRAIN_SECONDS: u64 = 0;

/// Database connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    pub port: u16,

    /// Database user.
    pub user: String,

    /// Database password.
    pub password: SecretString,

    /// Database name.
    pub name: String,

    /// Statement timeout applied to the session.
    pub statement_timeout_seconds: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("name", &self.name)
            .field("statement_timeout_seconds", &self.statement_timeout_seconds)
            .finish()
    }
}

/// API service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection settings.
    pub database: DatabaseConfig,

    /// Server bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Service name returned by `/health`.
    pub service_name: String,

    /// Base URL of the auth peer.
    pub auth_service_url: String,

    /// Base URL of the image peer.
    pub image_service_url: String,

    /// Timeout for a single peer probe.
    pub peer_timeout_seconds: u64,

    /// Interval between database heartbeats.
    pub heartbeat_interval_seconds: u64,

    /// Deadline for a single database heartbeat.
    /// Must be shorter than the interval so cycles never overlap.
    pub heartbeat_timeout_ms: u64,

    /// Drain period after SIGTERM/SIGINT before the process exits.
    pub shutdown_drain_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid database port: {0}")]
    InvalidDbPort(String),

    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),

    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let required = |name: &str| -> Result<String, ConfigError> {
            vars.get(name)
                .cloned()
                .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
        };

        let host = required("DB_HOST")?;
        let user = required("DB_USER")?;
        let password = SecretString::from(required("DB_PASSWORD")?);
        let name = required("DB_NAME")?;

        let port = match vars.get("DB_PORT") {
            Some(value_str) => value_str.parse::<u16>().map_err(|e| {
                ConfigError::InvalidDbPort(format!(
                    "DB_PORT must be a valid port number, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => DEFAULT_DB_PORT,
        };

        let statement_timeout_seconds = parse_positive(
            vars,
            "DB_STATEMENT_TIMEOUT_SECONDS",
            DEFAULT_DB_STATEMENT_TIMEOUT_SECONDS,
        )?;

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let service_name = vars
            .get("SERVICE_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let auth_service_url = vars
            .get("AUTH_SERVICE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_AUTH_SERVICE_URL.to_string());

        let image_service_url = vars
            .get("IMAGE_SERVICE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE_SERVICE_URL.to_string());

        let peer_timeout_seconds =
            parse_positive(vars, "PEER_TIMEOUT_SECONDS", DEFAULT_PEER_TIMEOUT_SECONDS)?;

        let heartbeat_interval_seconds = parse_positive(
            vars,
            "HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;

        if heartbeat_interval_seconds > MAX_HEARTBEAT_INTERVAL_SECONDS {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "HEARTBEAT_INTERVAL_SECONDS must be at most {}, got {}",
                MAX_HEARTBEAT_INTERVAL_SECONDS, heartbeat_interval_seconds
            )));
        }

        let heartbeat_timeout_ms =
            parse_positive(vars, "HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS)?;

        if heartbeat_timeout_ms >= heartbeat_interval_seconds.saturating_mul(1000) {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "HEARTBEAT_TIMEOUT_MS ({}) must be shorter than HEARTBEAT_INTERVAL_SECONDS ({}s)",
                heartbeat_timeout_ms, heartbeat_interval_seconds
            )));
        }

        let shutdown_drain_seconds = match vars.get("SHUTDOWN_DRAIN_SECONDS") {
            Some(value_str) => value_str.parse::<u64>().map_err(|e| {
                ConfigError::InvalidTimeout(format!(
                    "SHUTDOWN_DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => DEFAULT_SHUTDOWN_DRAIN_SECONDS,
        };

        Ok(Config {
            database: DatabaseConfig {
                host,
                port,
                user,
                password,
                name,
                statement_timeout_seconds,
            },
            bind_address,
            service_name,
            auth_service_url,
            image_service_url,
            peer_timeout_seconds,
            heartbeat_interval_seconds,
            heartbeat_timeout_ms,
            shutdown_drain_seconds,
        })
    }

    /// Peer probe timeout as a `Duration`.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_seconds)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Heartbeat probe deadline as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Parse an optional strictly positive integer variable.
fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidTimeout(format!(
            "{} must be a valid positive integer, got '{}': {}",
            name, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidTimeout(format!(
            "{} must be greater than 0",
            name
        )));
    }

    Ok(value)
}
