//! Endpoint identity and registration parsing

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DiscoveryError;

/// One reachable server on the internal transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "default_network")]
    pub network: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Endpoint {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            weight: default_weight(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(default_network(), address)
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `network@address`, the form used in registration paths
    pub fn key(&self) -> String {
        format!("{}@{}", self.network, self.address)
    }

    /// Weight used for balancing; a zero weight still gets picked
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }

    /// Parse `network@address`, or a bare address meaning TCP
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('@') {
            Some((network, address)) if !network.is_empty() && !address.is_empty() => {
                Some(Self::new(network, address))
            }
            Some(_) => None,
            None => Some(Self::tcp(raw)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.network, self.address)
    }
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Turn one registration entry into an endpoint.
///
/// The last segment of `key` is `network@address`; `metadata` is a URL
/// query string such as `weight=10&state=inactive`. Inactive registrations
/// yield `Ok(None)`.
pub fn parse_registration(key: &str, metadata: &str) -> Result<Option<Endpoint>, DiscoveryError> {
    let invalid = |reason: &str| DiscoveryError::InvalidRegistration {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let node = key
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    let (network, address) = node
        .split_once('@')
        .ok_or_else(|| invalid("expected network@address"))?;
    if network.is_empty() || address.is_empty() {
        return Err(invalid("empty network or address"));
    }

    let mut endpoint = Endpoint::new(network, address);
    for pair in metadata.trim().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value).map_err(|_| invalid("metadata is not UTF-8"))?;
        match name {
            "weight" => {
                endpoint.weight = value.trim().parse().unwrap_or_else(|_| default_weight());
            }
            "state" if value == "inactive" => return Ok(None),
            _ => {}
        }
    }

    Ok(Some(endpoint))
}
