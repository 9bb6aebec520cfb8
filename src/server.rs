//! HTTP surface of the capture service
//!
//! | Method | Path           | Purpose                                  |
//! |--------|----------------|------------------------------------------|
//! | GET    | `/health`      | Liveness plus pool state                 |
//! | POST   | `/screenshot`  | Capture (or serve from cache)            |
//! | GET    | `/cache/stats` | Cache occupancy                          |
//! | DELETE | `/cache`       | Drop every cached result                 |
//! | GET    | `/metrics`     | Prometheus exposition, when enabled      |

use crate::{now_iso, CaptureError, CaptureRequest, CaptureResult, CaptureService, Config};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Request bodies above this size are rejected before parsing.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const SERVICE_NAME: &str = "capture-service";

pub struct AppState {
    pub service: CaptureService,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: CaptureService) -> Self {
        Self {
            service,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/screenshot", post(screenshot))
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(clear_cache))
        .route("/metrics", get(render_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "success": false,
        "error": message.into(),
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = if self.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(CaptureResult::failed(&self))).into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": now_iso(),
        "service": SERVICE_NAME,
        "pool": state.service.pool_stats(),
    }))
}

async fn screenshot(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CaptureRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected screenshot request: {}", rejection.body_text());
            return failure(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    info!("Screenshot request: {} - {}", request.url, request.selector);

    match state.service.capture(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "stats": state.service.cache_stats(),
    }))
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.service.clear_cache().await;
    Json(json!({
        "success": true,
        "message": "Cache cleared successfully",
    }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => failure(StatusCode::NOT_FOUND, "Metrics endpoint is disabled"),
    }
}

/// Serves until `shutdown` resolves, then stops the pool.
pub async fn serve<F>(config: &Config, state: Arc<AppState>, shutdown: F) -> Result<(), CaptureError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let sweep = config
        .cache
        .sweep_interval
        .map(|interval| state.service.start_cache_sweep(interval));

    info!("Capture service listening on http://{}", address);
    let served = axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await;

    if let Some(sweep) = sweep {
        sweep.abort();
    }
    state.service.shutdown().await;
    info!("Capture service stopped");

    served.map_err(CaptureError::from)
}
