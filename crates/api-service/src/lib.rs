//! API Service Library
//!
//! A small HTTP service that reports on its own health and on the health of
//! the services it depends on:
//!
//! - Peer probes against the auth and image services
//! - A database probe over one long-lived PostgreSQL session
//! - Prometheus request metrics
//! - A database heartbeat that terminates the process on the first failure
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs
//!        |
//!        +-> middleware/http_metrics.rs -> observability/metrics.rs
//!
//! tasks/heartbeat.rs -> services/database.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Request instrumentation
//! - `models` - Response bodies and probe results
//! - `observability` - Metrics registry
//! - `routes` - Axum router setup
//! - `services` - Database session and peer probe client
//! - `tasks` - Background heartbeat watchdog

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod services;
pub mod tasks;
