//! Admin response models

use serde::Serialize;

use crate::client::PoolStats;
use crate::selector::EndpointState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub selector: String,
    pub pool: PoolStats,
}

/// Current endpoint set and blacklist state
#[derive(Debug, Serialize)]
pub struct EndpointsResponse {
    pub selector: String,
    pub endpoints: Vec<EndpointState>,
}
