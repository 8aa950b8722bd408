//! Liveness and readiness endpoints.
//!
//! - `GET /health`: 200 while starting or healthy, 503 when degraded or
//!   stopped. The body is the current [`HealthSnapshot`] plus uptime.
//! - `GET /ready`: 200 once a batch has been published, 503 before.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use simulator::{HealthSnapshot, HealthState};

#[derive(Serialize)]
struct HealthResponse {
    uptime_seconds: i64,
    #[serde(flatten)]
    snapshot: HealthSnapshot,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
}

/// Creates the health router.
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let code = if snapshot.status.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            uptime_seconds: snapshot.uptime_seconds(),
            snapshot,
        }),
    )
}

async fn readiness_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let ready = state.snapshot().is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadyResponse { ready }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn starting_producer_is_live_but_not_ready() {
        let state = Arc::new(HealthState::new());

        let (status, body) = get_json(health_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "starting");
        assert!(body["uptime_seconds"].as_i64().unwrap() >= 0);

        let (status, body) = get_json(health_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn published_batches_make_the_producer_ready() {
        let state = Arc::new(HealthState::new());
        state.record_published(12);

        let (status, body) = get_json(health_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["events_published"], 12);

        let (status, _) = get_json(health_router(state), "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn degraded_and_stopped_fail_the_health_check() {
        let state = Arc::new(HealthState::new());
        state.record_failure(3);
        let (status, body) = get_json(health_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["consecutive_failures"], 3);

        state.mark_stopped();
        let (status, body) = get_json(health_router(state), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "stopped");
    }
}
