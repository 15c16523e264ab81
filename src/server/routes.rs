//! HTTP routes definition

use axum::{extract::Extension, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use super::MonitorState;
use crate::bulk::MetricSnapshot;
use crate::metrics::export_metrics;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rebalancing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metric: MetricSnapshot,
}

/// Health and metrics routes
///
/// - GET /_monitoring/health - liveness, 503 once the bulk has aborted
/// - GET /metrics            - Prometheus text exposition
pub fn monitoring_routes() -> Router {
    Router::new()
        .route("/_monitoring/health", get(health))
        .route("/metrics", get(metrics_endpoint))
}

async fn health(
    Extension(state): Extension<Arc<MonitorState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let error = state.bulk.abort_reason();
    let code = if error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthResponse {
        status: if error.is_some() { "DOWN" } else { "UP" },
        rebalancing: state.bulk.is_rebalancing(),
        error,
        metric: state.bulk.metric().snapshot(),
    };
    (code, Json(body))
}

async fn metrics_endpoint(Extension(state): Extension<Arc<MonitorState>>) -> String {
    export_metrics(&state.registry)
}
