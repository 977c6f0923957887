pub mod health;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::anomaly::{AnomalyEngine, AnomalyThresholds};
use crate::hub::BroadcastHub;

pub use self::health::HealthMetrics;
pub use self::ws::Keepalive;

/// Shared state for axum handlers.
pub struct AppState {
    pub metrics: Arc<HealthMetrics>,
    pub hub: Arc<BroadcastHub>,
    pub engine: Arc<AnomalyEngine>,
    pub keepalive: Keepalive,
    /// Largest accepted inbound WebSocket frame in bytes.
    pub max_message_size: usize,
}

/// Builds the HTTP surface: metrics, health, subscriber upgrade and the
/// threshold/stats API.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/api/anomaly/thresholds",
            get(get_thresholds).put(put_thresholds),
        )
        .route("/api/machines/{id}/stats", get(machine_stats))
        .with_state(state)
}

/// HTTP server serving [`router`].
pub struct Server {
    addr: String,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Server {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            shutdown: Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background.
    ///
    /// Returns the bound address.
    pub async fn start(&self, state: Arc<AppState>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = router(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "http server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .metrics
        .machine_windows
        .set(state.engine.machine_count() as f64);

    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /api/anomaly/thresholds
async fn get_thresholds(State(state): State<Arc<AppState>>) -> Json<AnomalyThresholds> {
    Json(state.engine.thresholds())
}

/// PUT /api/anomaly/thresholds - 400 when the bounds are inconsistent.
async fn put_thresholds(
    State(state): State<Arc<AppState>>,
    Json(thresholds): Json<AnomalyThresholds>,
) -> Response {
    match state.engine.update_thresholds(thresholds) {
        Ok(()) => Json(thresholds).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/machines/{id}/stats - 404 for machines without a window.
async fn machine_stats(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.stats(&id) {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no data for machine {id}") })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    use crate::anomaly::DEFAULT_WINDOW_SIZE;
    use crate::config::HubConfig;
    use crate::event::{Status, TelemetryEvent};

    fn state() -> Arc<AppState> {
        let metrics = Arc::new(HealthMetrics::new().expect("metrics"));
        let hub_cfg = HubConfig::default();
        Arc::new(AppState {
            hub: Arc::new(BroadcastHub::new(
                hub_cfg.mailbox_capacity,
                Some(Arc::clone(&metrics)),
            )),
            engine: Arc::new(
                AnomalyEngine::new(AnomalyThresholds::default(), DEFAULT_WINDOW_SIZE)
                    .expect("engine"),
            ),
            keepalive: Keepalive::from(&hub_cfg),
            max_message_size: hub_cfg.max_message_size,
            metrics,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn put(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn test_healthz() {
        let resp = router(state()).oneshot(get_req("/healthz")).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_namespace() {
        let resp = router(state()).oneshot(get_req("/metrics")).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert!(text.contains("linewatch_machine_windows"));
    }

    #[tokio::test]
    async fn test_threshold_round_trip() {
        let state = state();
        let app = router(Arc::clone(&state));

        let update = serde_json::json!({
            "conveyor_speed_min": 0.5,
            "conveyor_speed_max": 3.0,
            "temperature_min": 10.0,
            "temperature_max": 80.0,
            "robot_angle_min": 0.0,
            "robot_angle_max": 180.0,
        });
        let resp = app
            .clone()
            .oneshot(put("/api/anomaly/thresholds", update))
            .await
            .expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(get_req("/api/anomaly/thresholds"))
            .await
            .expect("resp");
        let json = body_json(resp).await;
        assert_eq!(json["conveyor_speed_min"], 0.5);
        assert_eq!(json["temperature_max"], 80.0);
        assert_eq!(state.engine.thresholds().temperature_min, 10.0);
    }

    #[tokio::test]
    async fn test_invalid_thresholds_rejected() {
        let state = state();
        let before = state.engine.thresholds();

        let update = serde_json::json!({
            "conveyor_speed_min": 5.0,
            "conveyor_speed_max": 1.0,
        });
        let resp = router(Arc::clone(&state))
            .oneshot(put("/api/anomaly/thresholds", update))
            .await
            .expect("resp");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().expect("error").contains("conveyor_speed"));
        assert_eq!(state.engine.thresholds(), before);
    }

    #[tokio::test]
    async fn test_machine_stats() {
        let state = state();
        state.engine.analyze(Arc::new(TelemetryEvent {
            timestamp: Utc::now(),
            machine_id: "m9".to_string(),
            conveyor_speed: 1.5,
            temperature: 60.0,
            robot_arm_angle: 45.0,
            status: Status::Ok,
            event_type: "normal".to_string(),
            details: None,
        }));
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(get_req("/api/machines/m9/stats"))
            .await
            .expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["event_count"], 1);
        assert_eq!(json["avg_temperature"], 60.0);

        let resp = app
            .oneshot(get_req("/api/machines/unknown/stats"))
            .await
            .expect("resp");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = Server::new("127.0.0.1:0");
        let addr = server.start(state()).await.expect("start");
        assert_ne!(addr.port(), 0);
        server.stop().await.expect("stop");
    }
}
