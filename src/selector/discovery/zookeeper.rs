//! ZooKeeper discovery backend

use async_trait::async_trait;
use zookeeper_client::Client;

use super::Discovery;
use crate::error::DiscoveryError;
use crate::selector::endpoint::{Endpoint, parse_registration};

/// Endpoints registered as child znodes of the base path, named
/// `network@address` and holding URL-encoded metadata.
pub struct ZooKeeperDiscovery {
    client: Client,
    base_path: String,
}

impl ZooKeeperDiscovery {
    pub async fn connect(addresses: &[String], base_path: &str) -> Result<Self, DiscoveryError> {
        let cluster = addresses.join(",");
        let client = Client::connect(&cluster)
            .await
            .map_err(|e| DiscoveryError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            base_path: normalize_base_path(base_path),
        })
    }

    fn child_path(&self, child: &str) -> String {
        if self.base_path == "/" {
            format!("/{}", child)
        } else {
            format!("{}/{}", self.base_path, child)
        }
    }
}

/// Absolute path without a trailing slash
fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    format!("/{}", trimmed)
}

#[async_trait]
impl Discovery for ZooKeeperDiscovery {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let children = self
            .client
            .list_children(&self.base_path)
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let mut endpoints = Vec::with_capacity(children.len());
        for child in children {
            let path = self.child_path(&child);
            let data = match self.client.get_data(&path).await {
                Ok((data, _stat)) => data,
                // Unregistered between listing and reading
                Err(zookeeper_client::Error::NoNode) => continue,
                Err(e) => return Err(DiscoveryError::Backend(e.to_string())),
            };

            match parse_registration(&child, &String::from_utf8_lossy(&data)) {
                Ok(Some(endpoint)) => endpoints.push(endpoint),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "Skipping znode"),
            }
        }

        Ok(endpoints)
    }

    async fn watch(&self) -> Result<(), DiscoveryError> {
        let (_children, watcher) = self
            .client
            .list_and_watch_children(&self.base_path)
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let event = watcher.changed().await;
        tracing::debug!(event = ?event.event_type, "ZooKeeper children changed");
        Ok(())
    }
}
