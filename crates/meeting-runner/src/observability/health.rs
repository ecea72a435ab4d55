//! Health and metrics endpoints.
//!
//! - `GET /health` - liveness
//! - `GET /ready` - readiness; 503 until the store is reachable, and again
//!   once shutdown starts draining
//! - `GET /metrics` - Prometheus text format, when a handle is supplied

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared probe state for the runner process.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    store_ready: AtomicBool,
    draining: AtomicBool,
    meetings: AtomicUsize,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            store_ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            meetings: AtomicUsize::new(0),
        }
    }

    /// The store answered its startup probe.
    pub fn set_store_ready(&self) {
        self.store_ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness while in-flight meetings wind down.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn set_meetings(&self, count: usize) {
        self.meetings.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.store_ready.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }

    fn report(&self) -> ReadinessReport {
        let status = if self.draining.load(Ordering::SeqCst) {
            "draining"
        } else if self.store_ready.load(Ordering::SeqCst) {
            "ready"
        } else {
            "starting"
        };
        ReadinessReport {
            status,
            meetings: self.meetings.load(Ordering::SeqCst),
        }
    }
}

/// Body of `GET /ready`.
#[derive(Debug, Serialize)]
struct ReadinessReport {
    status: &'static str,
    meetings: usize,
}

/// Build the probe router. `/metrics` is mounted only when `metrics` is set.
pub fn health_router(state: Arc<HealthState>, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(state);

    match metrics {
        Some(handle) => router.route("/metrics", get(move || async move { handle.render() })),
        None => router,
    }
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessReport>) {
    let code = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.report()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn test_ready_requires_store_and_not_draining() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.set_store_ready();
        assert!(state.is_ready());

        state.set_draining();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_health_endpoint_ok() {
        let app = health_router(Arc::new(HealthState::new()), None);
        let (status, _) = get_path(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint_reports_status() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state), None);

        let (status, body) = get_path(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"starting\""));

        state.set_store_ready();
        state.set_meetings(3);
        let (status, body) = get_path(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"meetings\":3"));

        state.set_draining();
        let (status, body) = get_path(app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("\"draining\""));
    }

    #[tokio::test]
    async fn test_metrics_not_mounted_without_handle() {
        let app = health_router(Arc::new(HealthState::new()), None);
        let (status, _) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
