//! HTTP metrics middleware.
//!
//! Records one sample per request into the `MetricsRegistry` held in router
//! state, covering every response including framework-level ones produced
//! before a handler runs (404, 405) and panics converted to 500 by the
//! inner catch-panic layer.
//!
//! The route label is the matched route pattern, never the literal URL.
//! Requests that match no route are labelled `unmatched`.
//!
//! If the response future is dropped before completion (client went away,
//! server shutting down), the request is recorded with status 499.

use crate::models::MetricSample;
use crate::observability::MetricsRegistry;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Status label for requests abandoned before a response was produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Middleware that records request count and duration for all responses.
pub async fn http_metrics_middleware(
    State(metrics): State<Arc<MetricsRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_ROUTE.to_string(), |p| p.as_str().to_string());

    let recording = RequestRecording::start(metrics, request.method().to_string(), route);

    let response = next.run(request).await;

    recording.finish(response.status().as_u16());
    response
}

/// In-flight request, recorded exactly once.
struct RequestRecording {
    metrics: Arc<MetricsRegistry>,
    method: String,
    route: String,
    start: Instant,
    recorded: bool,
}

impl RequestRecording {
    fn start(metrics: Arc<MetricsRegistry>, method: String, route: String) -> Self {
        Self {
            metrics,
            method,
            route,
            start: Instant::now(),
            recorded: false,
        }
    }

    fn finish(mut self, status: u16) {
        self.record(status);
    }

    fn record(&mut self, status: u16) {
        if self.recorded {
            return;
        }
        self.recorded = true;

        self.metrics.record(&MetricSample {
            method: std::mem::take(&mut self.method),
            route: std::mem::take(&mut self.route),
            status,
            duration: self.start.elapsed(),
        });
    }
}

impl Drop for RequestRecording {
    fn drop(&mut self) {
        self.record(CLIENT_CLOSED_REQUEST);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::time::Duration;
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    async fn handler_200() -> &'static str {
        "OK"
    }

    async fn handler_500() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "Error")
    }

    #[allow(clippy::panic)]
    async fn handler_panic() -> &'static str {
        panic!("handler exploded")
    }

    async fn handler_hang() -> &'static str {
        std::future::pending::<()>().await;
        "unreachable"
    }

    fn test_app(metrics: Arc<MetricsRegistry>) -> Router {
        Router::new()
            .route("/success", get(handler_200))
            .route("/error", get(handler_500))
            .route("/panic", get(handler_panic))
            .route("/hang", get(handler_hang))
            .route("/items/:id", get(handler_200))
            .layer(CatchPanicLayer::new())
            .layer(middleware::from_fn_with_state(
                metrics,
                http_metrics_middleware,
            ))
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed")
    }

    fn registry() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new().expect("registry should build"))
    }

    #[tokio::test]
    async fn test_middleware_records_success() {
        let metrics = registry();

        let response = test_app(Arc::clone(&metrics))
            .oneshot(get_request("/success"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);

        let output = metrics.render();
        assert!(
            output.contains(r#"http_requests_total{method="GET",route="/success",status="200"} 1"#),
            "unexpected output:\n{output}"
        );
        assert!(output.contains(
            r#"http_request_duration_seconds_count{method="GET",route="/success",status="200"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_middleware_records_error_status() {
        let metrics = registry();

        let response = test_app(Arc::clone(&metrics))
            .oneshot(get_request("/error"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert!(metrics
            .render()
            .contains(r#"http_requests_total{method="GET",route="/error",status="500"} 1"#));
    }

    #[tokio::test]
    async fn test_middleware_labels_unmatched_routes() {
        let metrics = registry();

        let response = test_app(Arc::clone(&metrics))
            .oneshot(get_request("/nonexistent"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let output = metrics.render();
        assert!(output.contains(r#"route="unmatched",status="404"} 1"#));
        assert!(!output.contains("/nonexistent"));
    }

    #[tokio::test]
    async fn test_middleware_uses_route_pattern_not_literal_path() {
        let metrics = registry();
        let app = test_app(Arc::clone(&metrics));

        app.clone().oneshot(get_request("/items/1")).await.unwrap();
        app.oneshot(get_request("/items/2")).await.unwrap();

        let output = metrics.render();
        assert!(output.contains(r#"route="/items/:id",status="200"} 2"#));
        assert!(!output.contains("/items/1"));
    }

    #[tokio::test]
    async fn test_middleware_records_panic_as_500() {
        let metrics = registry();

        let response = test_app(Arc::clone(&metrics))
            .oneshot(get_request("/panic"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert!(metrics
            .render()
            .contains(r#"http_requests_total{method="GET",route="/panic",status="500"} 1"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_middleware_records_abandoned_request_once() {
        let metrics = registry();
        let app = test_app(Arc::clone(&metrics));

        let result =
            tokio::time::timeout(Duration::from_secs(1), app.oneshot(get_request("/hang"))).await;
        assert!(result.is_err(), "hanging handler should not complete");

        let output = metrics.render();
        assert!(
            output.contains(r#"http_requests_total{method="GET",route="/hang",status="499"} 1"#),
            "unexpected output:\n{output}"
        );
    }

    #[test]
    fn test_recording_is_exactly_once() {
        let metrics = registry();

        let recording =
            RequestRecording::start(Arc::clone(&metrics), "POST".to_string(), "/x".to_string());
        recording.finish(201);

        let output = metrics.render();
        assert!(output.contains(r#"http_requests_total{method="POST",route="/x",status="201"} 1"#));
        assert!(!output.contains(r#"status="499""#));
    }
}
