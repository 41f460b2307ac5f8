//! HTTP request handlers for the API service.

pub mod db_check;
pub mod dependencies;
pub mod health;
pub mod metrics;

pub use db_check::db_check;
pub use dependencies::{auth_check, image_check};
pub use health::{health_check, liveness, readiness, HealthState};
pub use metrics::metrics_handler;
