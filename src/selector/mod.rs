//! Endpoint selection
//!
//! A [`Selector`] is built once from a [`SelectorConfig`] and answers two
//! questions for the dispatcher: which endpoint to call next, and that an
//! endpoint just failed. The variants are closed; each registry kind maps to
//! exactly one constructor.

pub mod discovery;
pub mod endpoint;
pub mod weighted;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use discovery::{Discovery, DiscoveryKind, DiscoverySelector, MemoryDiscovery};
pub use endpoint::{Endpoint, parse_registration};
pub use weighted::{EndpointState, WeightedSelector};

use crate::error::{GatewayError, GatewayResult};

/// How long a failed endpoint stays out of rotation by default
pub const DEFAULT_BLACKLIST_DURATION: Duration = Duration::from_secs(120);

/// How often discovery-backed selectors re-list endpoints by default
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Balancing policy among eligible endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectPolicy {
    #[default]
    WeightedRoundRobin,
}

/// Declarative description of a selector
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorConfig {
    Direct {
        endpoint: Endpoint,
    },
    StaticMultiple {
        endpoints: Vec<Endpoint>,
        blacklist_duration: Duration,
        policy: SelectPolicy,
    },
    DiscoveryBacked {
        kind: DiscoveryKind,
        connection_string: String,
        base_path: String,
        refresh_interval: Duration,
        blacklist_duration: Duration,
        policy: SelectPolicy,
    },
}

/// Capability every selector variant provides
pub trait EndpointSelector: Send + Sync {
    /// Next endpoint to call, `None` when nothing is eligible
    fn next(&self) -> Option<Endpoint>;

    /// Report a connection-level failure on `endpoint`
    fn mark_failed(&self, endpoint: &Endpoint);

    /// Current endpoints with their eligibility
    fn endpoints(&self) -> Vec<EndpointState>;
}

/// Always the same endpoint; failures are not tracked
#[derive(Debug, Clone)]
pub struct DirectSelector {
    endpoint: Endpoint,
}

impl DirectSelector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl EndpointSelector for DirectSelector {
    fn next(&self) -> Option<Endpoint> {
        Some(self.endpoint.clone())
    }

    fn mark_failed(&self, _endpoint: &Endpoint) {}

    fn endpoints(&self) -> Vec<EndpointState> {
        vec![EndpointState {
            endpoint: self.endpoint.clone(),
            blacklisted: false,
            blacklist_remaining_ms: None,
        }]
    }
}

impl EndpointSelector for WeightedSelector {
    fn next(&self) -> Option<Endpoint> {
        WeightedSelector::next(self)
    }

    fn mark_failed(&self, endpoint: &Endpoint) {
        WeightedSelector::mark_failed(self, endpoint)
    }

    fn endpoints(&self) -> Vec<EndpointState> {
        self.states()
    }
}

/// The selector variants the gateway can run with
pub enum Selector {
    Direct(DirectSelector),
    Static(WeightedSelector),
    Discovery(DiscoverySelector),
}

impl Selector {
    /// Build the selector described by `config`.
    ///
    /// Discovery-backed selectors connect to their backend and load the
    /// initial endpoint set before returning.
    pub async fn from_config(config: SelectorConfig) -> GatewayResult<Self> {
        match config {
            SelectorConfig::Direct { endpoint } => Ok(Selector::Direct(DirectSelector::new(endpoint))),
            SelectorConfig::StaticMultiple {
                endpoints,
                blacklist_duration,
                policy: SelectPolicy::WeightedRoundRobin,
            } => {
                if endpoints.is_empty() {
                    return Err(GatewayError::Config(
                        "static selector needs at least one endpoint".to_string(),
                    ));
                }
                Ok(Selector::Static(WeightedSelector::new(
                    endpoints,
                    blacklist_duration,
                )))
            }
            SelectorConfig::DiscoveryBacked {
                kind,
                connection_string,
                base_path,
                refresh_interval,
                blacklist_duration,
                policy: SelectPolicy::WeightedRoundRobin,
            } => {
                let backend = discovery::connect(kind, &connection_string, &base_path).await?;
                let selector =
                    DiscoverySelector::start(backend, refresh_interval, blacklist_duration).await?;
                Ok(Selector::Discovery(selector))
            }
        }
    }

    /// Discovery-backed selector over an already connected backend
    pub async fn with_discovery(
        backend: Arc<dyn Discovery>,
        refresh_interval: Duration,
        blacklist_duration: Duration,
    ) -> GatewayResult<Self> {
        let selector = DiscoverySelector::start(backend, refresh_interval, blacklist_duration).await?;
        Ok(Selector::Discovery(selector))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Selector::Direct(_) => "direct",
            Selector::Static(_) => "static",
            Selector::Discovery(_) => "discovery",
        }
    }

    fn inner(&self) -> &dyn EndpointSelector {
        match self {
            Selector::Direct(s) => s,
            Selector::Static(s) => s,
            Selector::Discovery(s) => s,
        }
    }
}

impl EndpointSelector for Selector {
    fn next(&self) -> Option<Endpoint> {
        self.inner().next()
    }

    fn mark_failed(&self, endpoint: &Endpoint) {
        self.inner().mark_failed(endpoint)
    }

    fn endpoints(&self) -> Vec<EndpointState> {
        self.inner().endpoints()
    }
}
