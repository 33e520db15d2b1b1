//! In-process discovery backend

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Notify;

use super::Discovery;
use crate::error::DiscoveryError;
use crate::selector::endpoint::Endpoint;

/// Endpoint registry held in memory.
///
/// Useful for embedding the gateway next to a process that already knows
/// its backends, and for tests.
#[derive(Default)]
pub struct MemoryDiscovery {
    endpoints: RwLock<Vec<Endpoint>>,
    changed: Notify,
    failing: AtomicBool,
}

impl MemoryDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            ..Default::default()
        }
    }

    /// Replace the registered set and wake the watcher
    pub fn set(&self, endpoints: Vec<Endpoint>) {
        self.set_quietly(endpoints);
        // Stores a permit if nobody is waiting yet
        self.changed.notify_one();
    }

    /// Replace the registered set without signalling a change
    pub fn set_quietly(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = endpoints;
    }

    /// Make `list_endpoints` fail, simulating an unreachable backend
    pub fn fail_lists(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Backend("memory backend unavailable".to_string()));
        }
        Ok(self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn watch(&self) -> Result<(), DiscoveryError> {
        self.changed.notified().await;
        Ok(())
    }
}
