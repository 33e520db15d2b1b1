//! Admin request handlers

use axum::{Json, extract::State, http::StatusCode};

use super::models::{EndpointsResponse, HealthResponse};
use super::routes::AdminState;
use crate::selector::EndpointSelector;

/// GET /health - Gateway health check
pub async fn health(State(state): State<AdminState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            selector: state.client.selector().name().to_string(),
            pool: state.client.pool().stats(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AdminState>) -> String {
    state.prometheus_handle.render()
}

/// GET /endpoints - Endpoints known to the selector
pub async fn endpoints(State(state): State<AdminState>) -> Json<EndpointsResponse> {
    let selector = state.client.selector();
    Json(EndpointsResponse {
        selector: selector.name().to_string(),
        endpoints: selector.endpoints(),
    })
}
