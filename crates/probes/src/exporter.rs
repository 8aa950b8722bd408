//! Prometheus recorder and the `/metrics` endpoint.

use axum::routing::get;
use axum::Router;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use simulator::metric_names;

use crate::error::ProbeError;

/// Publish latency buckets, in seconds.
const PUBLISH_DURATION_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Builds a recorder without installing it.
pub fn build_recorder() -> Result<PrometheusRecorder, ProbeError> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(metric_names::PUBLISH_DURATION.to_owned()),
            PUBLISH_DURATION_BUCKETS,
        )
        .map_err(|e| ProbeError::Recorder(e.to_string()))?
        .build_recorder())
}

/// Installs the global Prometheus recorder and describes the producer metrics.
pub fn install_recorder() -> Result<PrometheusHandle, ProbeError> {
    let recorder = build_recorder()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| ProbeError::Recorder(e.to_string()))?;
    describe_metrics();
    Ok(handle)
}

/// Registers help text for every producer metric with the current recorder.
pub fn describe_metrics() {
    describe_counter!(
        metric_names::EVENTS_PUBLISHED,
        Unit::Count,
        "Sensor events delivered to the publisher"
    );
    describe_counter!(
        metric_names::BATCHES_FAILED,
        Unit::Count,
        "Batches dropped after exhausting retries"
    );
    describe_counter!(
        metric_names::PUBLISH_RETRIES,
        Unit::Count,
        "Publish attempts retried after a retryable error"
    );
    describe_histogram!(
        metric_names::PUBLISH_DURATION,
        Unit::Seconds,
        "Duration of a single publish attempt"
    );
    describe_gauge!(
        metric_names::ACTIVE_FAILURES,
        "Machines currently in a failure episode"
    );
    describe_gauge!(metric_names::MACHINES, "Simulated machines in the fleet");
}

/// Creates the metrics router serving `GET /metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use metrics::{counter, gauge};
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_renders_recorded_values() {
        let recorder = build_recorder().unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            counter!(metric_names::EVENTS_PUBLISHED).increment(30);
            gauge!(metric_names::MACHINES).set(10.0);
        });

        let response = metrics_router(handle)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("producer_events_published_total 30"));
        assert!(text.contains("producer_machines 10"));
        assert!(text.contains("# HELP producer_machines"));
    }
}
