//! Metrics registry for the API service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `process_` prefix for process-level gauges
//!
//! # Ownership
//!
//! The registry owns its own `PrometheusRecorder` and is never installed as
//! the process-global recorder. Recordings are routed into it with
//! `metrics::with_local_recorder`, so tests can build as many independent
//! registries as they need.
//!
//! # Cardinality
//!
//! - `method`: HTTP verbs
//! - `route`: matched route patterns, or `unmatched`
//! - `status`: numeric status code
//!
//! # Buckets
//!
//! `http_request_duration_seconds` uses 0.1, 0.5, 1, 2 and 5 seconds plus the
//! implicit `+Inf` bucket.

use crate::errors::ApiError;
use crate::models::MetricSample;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    with_local_recorder, Unit,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, System};

/// Request counter name.
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Request duration histogram name.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Histogram bucket upper bounds in seconds.
pub const HTTP_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0];

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const PROCESS_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
const PROCESS_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
const PROCESS_START_TIME_SECONDS: &str = "process_start_time_seconds";
const PROCESS_UPTIME_SECONDS: &str = "process_uptime_seconds";

/// Process-lifetime metrics registry.
///
/// Holds the request counter, the duration histogram and the process gauges.
/// Safe to share behind an `Arc`: updates go through the recorder's atomics,
/// and `render` reads a consistent snapshot of each metric.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    started_at: Instant,
    start_time_seconds: f64,
    pid: Option<Pid>,
}

impl MetricsRegistry {
    /// Build a registry with the HTTP duration buckets configured.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Metrics` if the bucket configuration is rejected.
    pub fn new() -> Result<Self, ApiError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
                HTTP_DURATION_BUCKETS,
            )
            .map_err(|e| ApiError::Metrics(format!("Failed to set HTTP request buckets: {e}")))?
            .build_recorder();
        let handle = recorder.handle();

        with_local_recorder(&recorder, || {
            describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests");
            describe_histogram!(
                HTTP_REQUEST_DURATION_SECONDS,
                Unit::Seconds,
                "Duration of HTTP requests in seconds"
            );
            describe_gauge!(
                PROCESS_RESIDENT_MEMORY_BYTES,
                Unit::Bytes,
                "Resident memory size in bytes"
            );
            describe_gauge!(
                PROCESS_VIRTUAL_MEMORY_BYTES,
                Unit::Bytes,
                "Virtual memory size in bytes"
            );
            describe_gauge!(
                PROCESS_START_TIME_SECONDS,
                Unit::Seconds,
                "Start time of the process since unix epoch in seconds"
            );
            describe_gauge!(
                PROCESS_UPTIME_SECONDS,
                Unit::Seconds,
                "Seconds since the metrics registry was created"
            );
        });

        let start_time_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(target: "api.metrics", error = %e, "Process memory gauges disabled");
                None
            }
        };

        Ok(Self {
            recorder,
            handle,
            started_at: Instant::now(),
            start_time_seconds,
            pid,
        })
    }

    /// Increment the request counter for a label combination.
    pub fn increment_request_count(&self, method: &str, route: &str, status: u16) {
        with_local_recorder(&self.recorder, || {
            counter!(HTTP_REQUESTS_TOTAL,
                "method" => method.to_string(),
                "route" => route.to_string(),
                "status" => status.to_string()
            )
            .increment(1);
        });
    }

    /// Record a request duration for a label combination.
    ///
    /// Negative or NaN inputs are clamped to 0.
    pub fn observe_duration(&self, method: &str, route: &str, status: u16, seconds: f64) {
        let seconds = clamp_duration(seconds);

        with_local_recorder(&self.recorder, || {
            histogram!(HTTP_REQUEST_DURATION_SECONDS,
                "method" => method.to_string(),
                "route" => route.to_string(),
                "status" => status.to_string()
            )
            .record(seconds);
        });
    }

    /// Record one completed request into both the counter and the histogram.
    pub fn record(&self, sample: &MetricSample) {
        self.increment_request_count(&sample.method, &sample.route, sample.status);
        self.observe_duration(
            &sample.method,
            &sample.route,
            sample.status,
            sample.duration.as_secs_f64(),
        );
    }

    /// Render every metric in the Prometheus text format.
    ///
    /// Families are emitted sorted by name and series sorted by label set,
    /// so two renders of the same state are byte-identical.
    pub fn render(&self) -> String {
        self.refresh_process_gauges();
        canonical_order(&self.handle.render())
    }

    fn refresh_process_gauges(&self) {
        let (resident, virtual_memory) = self.pid.map_or((0, 0), |pid| {
            let mut system = System::new();
            if system.refresh_process(pid) {
                system
                    .process(pid)
                    .map_or((0, 0), |p| (p.memory(), p.virtual_memory()))
            } else {
                (0, 0)
            }
        });
        let uptime = self.started_at.elapsed().as_secs_f64();

        with_local_recorder(&self.recorder, || {
            gauge!(PROCESS_RESIDENT_MEMORY_BYTES).set(resident as f64);
            gauge!(PROCESS_VIRTUAL_MEMORY_BYTES).set(virtual_memory as f64);
            gauge!(PROCESS_START_TIME_SECONDS).set(self.start_time_seconds);
            gauge!(PROCESS_UPTIME_SECONDS).set(uptime);
        });
    }
}

fn clamp_duration(seconds: f64) -> f64 {
    if seconds.is_nan() || seconds < 0.0 {
        0.0
    } else {
        seconds
    }
}

#[derive(Default)]
struct Family {
    header: Vec<String>,
    series: BTreeMap<String, Vec<String>>,
}

/// Reorder exposition text into a stable order.
///
/// Lines of one histogram series (buckets, `_sum`, `_count`) stay together
/// in their original relative order.
fn canonical_order(rendered: &str) -> String {
    let mut families: BTreeMap<String, Family> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in rendered.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# ") {
            let name = rest.split_whitespace().nth(1).unwrap_or_default().to_string();
            families
                .entry(name.clone())
                .or_default()
                .header
                .push(line.to_string());
            current = Some(name);
            continue;
        }

        let sample_name = line
            .split(|c: char| c == '{' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let family = match &current {
            Some(name) if sample_name.starts_with(name.as_str()) => name.clone(),
            _ => sample_name.to_string(),
        };

        families
            .entry(family)
            .or_default()
            .series
            .entry(series_key(line))
            .or_default()
            .push(line.to_string());
    }

    let mut out = String::with_capacity(rendered.len());
    for family in families.values() {
        for line in family.header.iter().chain(family.series.values().flatten()) {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Label set of a sample line without the histogram `le` label.
fn series_key(line: &str) -> String {
    let labels = match (line.find('{'), line.rfind('}')) {
        (Some(start), Some(end)) if start < end => line.get(start + 1..end).unwrap_or_default(),
        _ => "",
    };

    labels
        .split(',')
        .filter(|pair| !pair.starts_with("le="))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::new().expect("registry should build")
    }

    #[test]
    fn test_increment_creates_counter_cell() {
        let registry = registry();
        registry.increment_request_count("GET", "/health", 200);
        registry.increment_request_count("GET", "/health", 200);

        let output = registry.render();
        assert!(
            output.contains(r#"http_requests_total{method="GET",route="/health",status="200"} 2"#),
            "unexpected output:\n{output}"
        );
    }

    #[test]
    fn test_distinct_labels_get_distinct_cells() {
        let registry = registry();
        registry.increment_request_count("GET", "/auth-check", 200);
        registry.increment_request_count("GET", "/auth-check", 500);

        let output = registry.render();
        assert!(output.contains(r#"route="/auth-check",status="200"} 1"#));
        assert!(output.contains(r#"route="/auth-check",status="500"} 1"#));
    }

    #[test]
    fn test_observe_duration_uses_configured_buckets() {
        let registry = registry();
        registry.observe_duration("GET", "/db-check", 200, 0.3);

        let output = registry.render();
        assert!(output.contains("# TYPE http_request_duration_seconds histogram"));
        assert!(output.contains(r#"status="200",le="0.1"} 0"#));
        assert!(output.contains(r#"status="200",le="0.5"} 1"#));
        assert!(output.contains(r#"status="200",le="+Inf"} 1"#));
        assert!(output.contains(
            r#"http_request_duration_seconds_count{method="GET",route="/db-check",status="200"} 1"#
        ));
    }

    #[test]
    fn test_negative_duration_is_clamped_to_zero() {
        let registry = registry();
        registry.observe_duration("GET", "/health", 200, -1.5);

        let output = registry.render();
        assert!(output.contains(
            r#"http_request_duration_seconds_sum{method="GET",route="/health",status="200"} 0"#
        ));
        assert!(output.contains(r#"status="200",le="0.1"} 1"#));
    }

    #[test]
    fn test_clamp_duration() {
        assert_eq!(clamp_duration(-0.5), 0.0);
        assert_eq!(clamp_duration(f64::NAN), 0.0);
        assert_eq!(clamp_duration(1.25), 1.25);
    }

    #[test]
    fn test_record_updates_counter_and_histogram() {
        let registry = registry();
        registry.record(&MetricSample {
            method: "GET".to_string(),
            route: "/metrics".to_string(),
            status: 200,
            duration: Duration::from_millis(20),
        });

        let output = registry.render();
        assert!(output.contains(r#"http_requests_total{method="GET",route="/metrics",status="200"} 1"#));
        assert!(output.contains(
            r#"http_request_duration_seconds_count{method="GET",route="/metrics",status="200"} 1"#
        ));
    }

    #[test]
    fn test_render_includes_process_gauges() {
        let output = registry().render();

        assert!(output.contains("process_start_time_seconds"));
        assert!(output.contains("process_uptime_seconds"));
        assert!(output.contains("process_resident_memory_bytes"));
    }

    #[test]
    fn test_render_includes_help_text() {
        let registry = registry();
        registry.increment_request_count("GET", "/health", 200);

        let output = registry.render();
        assert!(output.contains("# HELP http_requests_total Total number of HTTP requests"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = registry();
        let second = registry();
        first.increment_request_count("GET", "/only-first", 200);

        assert!(first.render().contains("/only-first"));
        assert!(!second.render().contains("/only-first"));
    }

    #[test]
    fn test_canonical_order_sorts_families_and_series() {
        let shuffled = "\
# TYPE b_total counter
b_total{route=\"/z\"} 1
b_total{route=\"/a\"} 2

# TYPE a_seconds histogram
a_seconds_bucket{route=\"/x\",le=\"1\"} 1
a_seconds_bucket{route=\"/x\",le=\"+Inf\"} 1
a_seconds_sum{route=\"/x\"} 0.2
a_seconds_count{route=\"/x\"} 1
";
        let expected = "\
# TYPE a_seconds histogram
a_seconds_bucket{route=\"/x\",le=\"1\"} 1
a_seconds_bucket{route=\"/x\",le=\"+Inf\"} 1
a_seconds_sum{route=\"/x\"} 0.2
a_seconds_count{route=\"/x\"} 1

# TYPE b_total counter
b_total{route=\"/a\"} 2
b_total{route=\"/z\"} 1

";
        assert_eq!(canonical_order(shuffled), expected);
    }

    #[test]
    fn test_render_is_stable() {
        let registry = registry();
        registry.increment_request_count("GET", "/b", 200);
        registry.increment_request_count("GET", "/a", 200);

        let strip_gauges = |s: String| {
            s.lines()
                .filter(|l| !l.starts_with("process_"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip_gauges(registry.render()), strip_gauges(registry.render()));
    }

    #[test]
    fn test_series_key_drops_le() {
        assert_eq!(
            series_key(r#"x_bucket{method="GET",route="/a",le="0.5"} 1"#),
            r#"method="GET",route="/a""#
        );
        assert_eq!(series_key("x_total 3"), "");
    }
}
