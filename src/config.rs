//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::client::ClientOptions;
use crate::error::{GatewayError, GatewayResult};
use crate::selector::{DiscoveryKind, Endpoint, SelectPolicy, SelectorConfig};

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// gRPC listen address
    pub listen_addr: String,
    /// Admin HTTP port, disabled when unset
    pub admin_port: Option<u16>,
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    /// Largest inbound/outbound gRPC message
    pub max_message_size_mb: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_port: None,
            registry: RegistryConfig::default(),
            client: ClientConfig::default(),
            max_message_size_mb: default_max_message_size_mb(),
        }
    }
}

/// Where internal service endpoints come from
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// One of `direct`, `multi`, `zookeeper`, `etcdv3`, `consul`
    pub kind: String,
    /// Kind-specific positional parameters
    pub opts: Vec<String>,
    /// Weighted endpoints for `multi`, used when `opts` is empty
    pub endpoints: Vec<Endpoint>,
    pub blacklist_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: default_registry_kind(),
            opts: vec!["tcp".to_string(), "127.0.0.1:8972".to_string()],
            endpoints: Vec::new(),
            blacklist_secs: default_blacklist_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// Internal transport client settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Total attempts per call
    pub retries: usize,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            call_timeout_ms: default_call_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClientConfig {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            retries: self.retries,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Registry kinds accepted on the command line and in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Direct,
    Multi,
    Discovery(DiscoveryKind),
}

impl FromStr for RegistryKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(RegistryKind::Direct),
            "multi" => Ok(RegistryKind::Multi),
            other => other
                .parse::<DiscoveryKind>()
                .map(RegistryKind::Discovery)
                .map_err(|_| GatewayError::Config(format!("unknown registry kind: {}", other))),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKind::Direct => f.write_str("direct"),
            RegistryKind::Multi => f.write_str("multi"),
            RegistryKind::Discovery(kind) => write!(f, "{}", kind),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(addr) = std::env::var("WIRE_GATEWAY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(kind) = std::env::var("WIRE_GATEWAY_REGISTRY") {
            config.registry.kind = kind;
        }
        if let Ok(opts) = std::env::var("WIRE_GATEWAY_REGISTRY_OPTS") {
            config.registry.opts = split_opts(&opts);
        }
        if let Ok(port) = std::env::var("WIRE_GATEWAY_ADMIN_PORT") {
            config.admin_port = Some(
                port.parse()
                    .context("Invalid WIRE_GATEWAY_ADMIN_PORT value")?,
            );
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            anyhow::bail!("Listen address cannot be empty");
        }
        if self.client.retries == 0 {
            anyhow::bail!("Client retries must be at least 1");
        }
        if self.client.call_timeout_ms == 0 {
            anyhow::bail!("Call timeout must be greater than zero");
        }
        if self.client.max_frame_size == 0 {
            anyhow::bail!("Max frame size must be greater than zero");
        }
        if self.max_message_size_mb == 0 {
            anyhow::bail!("Max message size must be greater than zero");
        }
        if self.registry.refresh_interval_secs == 0 {
            anyhow::bail!("Refresh interval must be greater than zero");
        }

        self.selector_config()
            .map_err(|e| anyhow::anyhow!("Invalid registry settings: {}", e))?;

        Ok(())
    }

    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_secs(self.registry.blacklist_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry.refresh_interval_secs)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_mb * 1024 * 1024
    }

    /// Translate the registry section into a selector description
    pub fn selector_config(&self) -> GatewayResult<SelectorConfig> {
        let kind: RegistryKind = self.registry.kind.parse()?;
        let opts = &self.registry.opts;

        match kind {
            RegistryKind::Direct => {
                let [network, address] = opts.as_slice() else {
                    return Err(GatewayError::Config(format!(
                        "direct registry expects <network> <address>, got {:?}",
                        opts
                    )));
                };
                Ok(SelectorConfig::Direct {
                    endpoint: Endpoint::new(network.as_str(), address.as_str()),
                })
            }
            RegistryKind::Multi => {
                let endpoints = match opts.first() {
                    Some(addresses) => addresses
                        .split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(Endpoint::tcp)
                        .collect(),
                    None => self.registry.endpoints.clone(),
                };
                if endpoints.is_empty() {
                    return Err(GatewayError::Config(
                        "multi registry expects a comma-separated address list".to_string(),
                    ));
                }
                Ok(SelectorConfig::StaticMultiple {
                    endpoints,
                    blacklist_duration: self.blacklist_duration(),
                    policy: SelectPolicy::WeightedRoundRobin,
                })
            }
            RegistryKind::Discovery(kind) => {
                let [connection_string, base_path] = opts.as_slice() else {
                    return Err(GatewayError::Config(format!(
                        "{} registry expects <addresses> <base path>, got {:?}",
                        kind, opts
                    )));
                };
                Ok(SelectorConfig::DiscoveryBacked {
                    kind,
                    connection_string: connection_string.clone(),
                    base_path: base_path.clone(),
                    refresh_interval: self.refresh_interval(),
                    blacklist_duration: self.blacklist_duration(),
                    policy: SelectPolicy::WeightedRoundRobin,
                })
            }
        }
    }
}

/// Split a space separated parameter string
pub fn split_opts(opts: &str) -> Vec<String> {
    opts.split_whitespace().map(String::from).collect()
}

// Default functions
fn default_listen_addr() -> String {
    "0.0.0.0:9981".to_string()
}
fn default_registry_kind() -> String {
    "direct".to_string()
}
fn default_blacklist_secs() -> u64 {
    120
}
fn default_refresh_interval_secs() -> u64 {
    60
}
fn default_retries() -> usize {
    3
}
fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_frame_size() -> usize {
    crate::codec::DEFAULT_MAX_FRAME_SIZE
}
fn default_max_message_size_mb() -> usize {
    16
}
