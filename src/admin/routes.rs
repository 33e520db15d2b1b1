//! Admin route definitions

use axum::{Router, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::client::InternalClient;

/// State shared across admin handlers
#[derive(Clone)]
pub struct AdminState {
    pub client: Arc<InternalClient>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the admin router
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/endpoints", get(handlers::endpoints))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
