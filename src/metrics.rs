//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a forwarded call.
///
/// Method names come from callers, so they never become label values.
pub fn record_call() {
    metrics::counter!("wire_gateway_calls_total").increment(1);
}

/// Record a call that ended in an error
pub fn record_call_failure(kind: &'static str) {
    metrics::counter!("wire_gateway_call_failures_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a retry on another endpoint
pub fn record_retry(endpoint: &str) {
    metrics::counter!("wire_gateway_retries_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record an endpoint being taken out of rotation
pub fn record_endpoint_blacklisted(endpoint: &str) {
    metrics::counter!("wire_gateway_endpoints_blacklisted_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Update the discovered endpoint count gauge
pub fn update_live_endpoints(count: usize) {
    metrics::gauge!("wire_gateway_endpoints_live").set(count as f64);
}
