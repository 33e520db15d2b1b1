//! etcd v3 discovery backend

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, WatchOptions};

use super::Discovery;
use crate::error::DiscoveryError;
use crate::selector::endpoint::{Endpoint, parse_registration};

/// Endpoints registered as keys under a prefix, `<base>/<network@address>`,
/// with URL-encoded metadata as the value.
pub struct EtcdDiscovery {
    client: Client,
    prefix: String,
}

impl EtcdDiscovery {
    pub async fn connect(addresses: Vec<String>, base_path: &str) -> Result<Self, DiscoveryError> {
        let client = Client::connect(addresses, None)
            .await
            .map_err(|e| DiscoveryError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            prefix: registration_prefix(base_path),
        })
    }
}

/// Base path with exactly one trailing slash
pub(crate) fn registration_prefix(base_path: &str) -> String {
    format!("{}/", base_path.trim_end_matches('/'))
}

#[async_trait]
impl Discovery for EtcdDiscovery {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let mut endpoints = Vec::new();
        for kv in resp.kvs() {
            let key = String::from_utf8_lossy(kv.key());
            let value = String::from_utf8_lossy(kv.value());
            match parse_registration(&key, &value) {
                Ok(Some(endpoint)) => endpoints.push(endpoint),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "Skipping etcd key"),
            }
        }

        Ok(endpoints)
    }

    async fn watch(&self) -> Result<(), DiscoveryError> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(self.prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        match stream.message().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(DiscoveryError::Backend("etcd watch stream closed".to_string())),
            Err(e) => Err(DiscoveryError::Backend(e.to_string())),
        }
    }
}
