//! Observability module for the API service.
//!
//! Provides the metrics registry and its Prometheus text rendering.

pub mod metrics;

pub use metrics::MetricsRegistry;
