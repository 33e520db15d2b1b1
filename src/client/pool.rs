//! Connection pool keyed by endpoint

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::connection::Connection;
use crate::error::GatewayResult;
use crate::selector::Endpoint;

/// One shared connection per endpoint.
///
/// Lookups are lock-free reads; a missing or broken connection is dialed
/// outside the map lock and then installed, so concurrent callers for the
/// same endpoint end up sharing whichever connection lands first.
#[derive(Clone)]
pub struct ConnectionPool {
    // endpoint key -> connection
    connections: Arc<DashMap<String, Arc<Connection>>>,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            connect_timeout,
            max_frame_size,
        }
    }

    /// Get the pooled connection for `endpoint`, dialing if needed
    pub async fn get(&self, endpoint: &Endpoint) -> GatewayResult<Arc<Connection>> {
        let key = endpoint.key();

        // Fast path: healthy connection already pooled
        if let Some(conn) = self.connections.get(&key)
            && conn.is_usable()
        {
            return Ok(conn.clone());
        }

        let dialed = Arc::new(
            Connection::dial(endpoint, self.connect_timeout, self.max_frame_size).await?,
        );

        match self.connections.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_usable() {
                    // Another caller won the race; ours is dropped
                    Ok(entry.get().clone())
                } else {
                    entry.insert(dialed.clone());
                    Ok(dialed)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(dialed.clone());
                tracing::debug!(endpoint = %endpoint, "Pooled new connection");
                Ok(dialed)
            }
        }
    }

    /// Install an externally established connection
    pub fn insert(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        self.connections
            .insert(conn.endpoint().key(), conn.clone());
        conn
    }

    /// Drop `conn` if it is still the pooled connection for its endpoint
    pub fn evict_connection(&self, conn: &Arc<Connection>) -> bool {
        let removed = self
            .connections
            .remove_if(&conn.endpoint().key(), |_, pooled| Arc::ptr_eq(pooled, conn))
            .is_some();
        if removed {
            tracing::debug!(endpoint = %conn.endpoint(), "Evicted connection from pool");
        }
        removed
    }

    /// Drop connections whose endpoint is not in `live`
    pub fn retain_endpoints(&self, live: &[Endpoint]) {
        let keys: HashSet<String> = live.iter().map(Endpoint::key).collect();
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !keys.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.connections.remove(key);
        }
        if !stale.is_empty() {
            tracing::debug!(
                pruned = stale.len(),
                remaining = self.connections.len(),
                "Pruned pooled connections"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.connections.len(),
            in_flight_calls: self.connections.iter().map(|c| c.in_flight()).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub in_flight_calls: usize,
}
