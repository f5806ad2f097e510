use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::update::guard::RunGuard;
use crate::update::store::{UpdateState, UpdateStore};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn UpdateStore>,
    pub guard: RunGuard,
    pub monitor: Option<Arc<Monitor>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiUpdate {
    #[serde(flatten)]
    pub state: UpdateState,
    pub running: bool,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/update", get(update_handler))
        .route("/api/monitor", get(monitor_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.refresh_uptime();
    if let Some(monitor) = &state.monitor {
        state.metrics.update_from_snapshot(&monitor.snapshot());
    }
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn update_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(ApiUpdate {
        state: state.store.load(),
        running: state.guard.is_running(),
    })
}

async fn monitor_handler(State(state): State<HttpAppState>) -> Response {
    match &state.monitor {
        Some(monitor) => Json(monitor.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, "no process monitor attached").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::probe::{MemoryInfo, ProbeError, ProcessProbe};
    use crate::update::store::{MemoryStore, UpdateStatus};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state(monitor: Option<Arc<Monitor>>) -> HttpAppState {
        HttpAppState {
            metrics: Metrics::new().expect("metrics init"),
            store: Arc::new(MemoryStore::new("v1.0.0")),
            guard: RunGuard::new(),
            monitor,
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    struct IdleProbe;

    impl ProcessProbe for IdleProbe {
        fn is_running(&self) -> Result<bool, ProbeError> {
            Ok(true)
        }
        fn cpu_percent(&self) -> Result<f64, ProbeError> {
            Ok(3.5)
        }
        fn memory_info(&self) -> Result<MemoryInfo, ProbeError> {
            Ok(MemoryInfo { rss: 100, vms: 200 })
        }
        fn num_threads(&self) -> Result<u32, ProbeError> {
            Ok(4)
        }
        fn status(&self) -> Result<Vec<String>, ProbeError> {
            Ok(vec!["sleep".to_string()])
        }
        fn create_time(&self) -> Result<i64, ProbeError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (status, body) = get_body(build_router(app_state(None)), "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime_and_update_checks() {
        let state = app_state(None);
        state.metrics.inc_update_check("latest");
        let (status, body) = get_body(build_router(state), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("panelkeeper_uptime_seconds"));
        assert!(body.contains("panelkeeper_update_checks_total{outcome=\"latest\"} 1"));
    }

    #[tokio::test]
    async fn api_update_reports_state_and_guard() {
        let state = app_state(None);
        state
            .store
            .set_status(&UpdateStatus::LatestVersion)
            .unwrap();
        let _permit = state.guard.try_acquire().unwrap();
        let (status, body) = get_body(build_router(state), "/api/update").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["version"], "v1.0.0");
        assert_eq!(json["status"], "latest version");
        assert_eq!(json["running"], true);
    }

    #[tokio::test]
    async fn api_monitor_without_monitor_is_not_found() {
        let (status, _) = get_body(build_router(app_state(None)), "/api/monitor").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn api_monitor_returns_latest_snapshot() {
        let monitor = Arc::new(Monitor::with_probe(77, Arc::new(IdleProbe)));
        monitor.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let state = app_state(Some(monitor.clone()));
        let (status, body) = get_body(build_router(state.clone()), "/api/monitor").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["pid"], 77);
        assert_eq!(json["running"], true);
        assert_eq!(json["threads"], 4);

        let (_, metrics) = get_body(build_router(state), "/metrics").await;
        assert!(metrics.contains("panelkeeper_process_rss_bytes 100"));
        monitor.stop();
    }
}
