//! Consul discovery backend, over the HTTP health API

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Discovery;
use crate::error::DiscoveryError;
use crate::selector::endpoint::Endpoint;

/// Longest a blocking query waits for a change
const WATCH_WAIT: Duration = Duration::from_secs(55);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeInfo,
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
    #[serde(default)]
    weights: Option<Weights>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Weights {
    passing: u32,
}

/// Passing instances of one Consul service
pub struct ConsulDiscovery {
    http: reqwest::Client,
    base_url: String,
    service: String,
    // X-Consul-Index of the last response, for blocking queries
    index: AtomicU64,
}

impl ConsulDiscovery {
    pub fn new(address: &str, service_path: &str) -> Result<Self, DiscoveryError> {
        let service = service_name(service_path)
            .ok_or_else(|| DiscoveryError::Connect("empty Consul service name".to_string()))?;

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        let http = reqwest::Client::builder()
            .timeout(WATCH_WAIT + Duration::from_secs(10))
            .build()
            .map_err(|e| DiscoveryError::Connect(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            service,
            index: AtomicU64::new(0),
        })
    }

    async fn query(&self, wait_index: Option<u64>) -> Result<Vec<HealthEntry>, DiscoveryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, self.service);
        let mut request = self.http.get(&url).query(&[("passing", "true")]);
        if let Some(index) = wait_index {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", WATCH_WAIT.as_secs())),
            ]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Backend(format!(
                "Consul returned status {}",
                response.status()
            )));
        }

        if let Some(index) = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.index.store(index, Ordering::SeqCst);
        }

        response
            .json()
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))
    }
}

/// Consul names have no slashes; take the last segment of a path
fn service_name(path: &str) -> Option<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .next_back()
        .map(String::from)
}

fn to_endpoint(entry: HealthEntry) -> Option<Endpoint> {
    let meta = entry.service.meta.unwrap_or_default();
    if meta.get("state").is_some_and(|s| s == "inactive") {
        return None;
    }

    let host = if entry.service.address.is_empty() {
        entry.node.address
    } else {
        entry.service.address
    };
    let address = if host.contains(':') {
        // IPv6 literal
        format!("[{}]:{}", host, entry.service.port)
    } else {
        format!("{}:{}", host, entry.service.port)
    };

    let weight = meta
        .get("weight")
        .and_then(|w| w.parse().ok())
        .or(entry.service.weights.map(|w| w.passing))
        .unwrap_or(1);

    Some(Endpoint::tcp(address).with_weight(weight))
}

#[async_trait]
impl Discovery for ConsulDiscovery {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let entries = self.query(None).await?;
        Ok(entries.into_iter().filter_map(to_endpoint).collect())
    }

    async fn watch(&self) -> Result<(), DiscoveryError> {
        let last = self.index.load(Ordering::SeqCst);
        loop {
            self.query(Some(last)).await?;
            // A timed out blocking query returns the same index
            if self.index.load(Ordering::SeqCst) != last {
                return Ok(());
            }
        }
    }
}
