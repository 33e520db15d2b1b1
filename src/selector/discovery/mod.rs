//! Discovery-backed endpoint selection
//!
//! A [`Discovery`] backend publishes the live endpoint set under a
//! registration path. [`DiscoverySelector`] loads that set, balances over it
//! with [`WeightedSelector`], and keeps it fresh from a background task that
//! re-lists on every refresh tick and whenever the backend reports a change.

pub mod consul;
pub mod etcd;
pub mod memory;
pub mod zookeeper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use consul::ConsulDiscovery;
pub use etcd::EtcdDiscovery;
pub use memory::MemoryDiscovery;
pub use zookeeper::ZooKeeperDiscovery;

use super::endpoint::Endpoint;
use super::weighted::{EndpointState, WeightedSelector};
use super::EndpointSelector;
use crate::error::DiscoveryError;

/// Coordination services the gateway can discover endpoints from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    Zookeeper,
    Etcdv3,
    Consul,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryKind::Zookeeper => "zookeeper",
            DiscoveryKind::Etcdv3 => "etcdv3",
            DiscoveryKind::Consul => "consul",
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zookeeper" => Ok(DiscoveryKind::Zookeeper),
            "etcdv3" => Ok(DiscoveryKind::Etcdv3),
            "consul" => Ok(DiscoveryKind::Consul),
            other => Err(format!("unknown discovery kind '{}'", other)),
        }
    }
}

/// Source of the live endpoint set for one registration path
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current registered endpoints
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError>;

    /// Resolves once the registered set may have changed
    async fn watch(&self) -> Result<(), DiscoveryError>;
}

/// Connect to the backend of `kind`.
///
/// `connection_string` is a comma separated list of backend addresses.
/// `base_path` is the registration path (the service name for Consul).
pub async fn connect(
    kind: DiscoveryKind,
    connection_string: &str,
    base_path: &str,
) -> Result<Arc<dyn Discovery>, DiscoveryError> {
    let addresses: Vec<String> = connection_string
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if addresses.is_empty() {
        return Err(DiscoveryError::Connect(format!(
            "no {} addresses configured",
            kind
        )));
    }

    tracing::info!(
        kind = %kind,
        addresses = ?addresses,
        base_path = base_path,
        "Connecting to discovery backend"
    );

    let backend: Arc<dyn Discovery> = match kind {
        DiscoveryKind::Zookeeper => {
            Arc::new(ZooKeeperDiscovery::connect(&addresses, base_path).await?)
        }
        DiscoveryKind::Etcdv3 => Arc::new(EtcdDiscovery::connect(addresses, base_path).await?),
        DiscoveryKind::Consul => Arc::new(ConsulDiscovery::new(&addresses[0], base_path)?),
    };

    Ok(backend)
}

/// Weighted round robin over a discovered, periodically refreshed endpoint set
pub struct DiscoverySelector {
    selector: Arc<WeightedSelector>,
    refresh_task: JoinHandle<()>,
}

impl DiscoverySelector {
    /// Load the initial endpoint set and start the refresh task
    pub async fn start(
        backend: Arc<dyn Discovery>,
        refresh_interval: Duration,
        blacklist_duration: Duration,
    ) -> Result<Self, DiscoveryError> {
        let endpoints = backend.list_endpoints().await?;
        if endpoints.is_empty() {
            tracing::warn!("Discovery returned no endpoints, calls fail until some register");
        } else {
            tracing::info!(count = endpoints.len(), "Loaded endpoints from discovery");
        }
        crate::metrics::update_live_endpoints(endpoints.len());

        let selector = Arc::new(WeightedSelector::new(endpoints, blacklist_duration));
        let refresh_task = tokio::spawn(refresh_loop(
            backend,
            selector.clone(),
            refresh_interval,
        ));

        Ok(Self {
            selector,
            refresh_task,
        })
    }

    pub fn snapshot(&self) -> Arc<[Endpoint]> {
        self.selector.snapshot()
    }
}

impl Drop for DiscoverySelector {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

impl EndpointSelector for DiscoverySelector {
    fn next(&self) -> Option<Endpoint> {
        self.selector.next()
    }

    fn mark_failed(&self, endpoint: &Endpoint) {
        self.selector.mark_failed(endpoint)
    }

    fn endpoints(&self) -> Vec<EndpointState> {
        self.selector.states()
    }
}

async fn refresh_loop(
    backend: Arc<dyn Discovery>,
    selector: Arc<WeightedSelector>,
    refresh_interval: Duration,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial list is already loaded
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = backend.watch() => {
                if let Err(e) = changed {
                    // Fall back to the refresh interval until the watch recovers
                    tracing::warn!(error = %e, "Discovery watch failed");
                    ticker.tick().await;
                }
            }
        }

        match backend.list_endpoints().await {
            Ok(endpoints) => {
                let previous = selector.snapshot();
                // Unchanged sets keep the balancing cursor where it is
                if !same_members(&previous, &endpoints) {
                    tracing::info!(
                        previous = previous.len(),
                        current = endpoints.len(),
                        "Endpoint set changed"
                    );
                    crate::metrics::update_live_endpoints(endpoints.len());
                    selector.replace(endpoints);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh endpoints, keeping previous set");
            }
        }
    }
}

/// Same endpoints with the same weights, in any order
fn same_members(a: &[Endpoint], b: &[Endpoint]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let members = |endpoints: &[Endpoint]| {
        let mut keys: Vec<(String, u32)> = endpoints
            .iter()
            .map(|e| (e.key(), e.weight))
            .collect();
        keys.sort_unstable();
        keys
    };
    members(a) == members(b)
}
