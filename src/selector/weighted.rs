//! Smooth weighted round robin with a time-bounded blacklist

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::endpoint::Endpoint;

/// Endpoint plus its current eligibility, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointState {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub blacklisted: bool,
    /// Time left until the endpoint is eligible again
    pub blacklist_remaining_ms: Option<u64>,
}

struct Cursor {
    snapshot: Arc<[Endpoint]>,
    current: Vec<i64>,
}

impl Cursor {
    fn new(endpoints: Vec<Endpoint>) -> Self {
        let current = vec![0; endpoints.len()];
        Self {
            snapshot: endpoints.into(),
            current,
        }
    }
}

/// Weighted round robin over a replaceable endpoint snapshot.
///
/// Each pick adds every eligible endpoint's weight to its running weight and
/// takes the largest, first in snapshot order on ties; the winner then gives
/// back the total. Over `W` picks each endpoint is chosen exactly `w_i`
/// times, spread out rather than in bursts.
pub struct WeightedSelector {
    cursor: Mutex<Cursor>,
    // endpoint key -> instant the endpoint becomes eligible again
    blacklist: DashMap<String, Instant>,
    blacklist_duration: Duration,
}

impl WeightedSelector {
    pub fn new(endpoints: Vec<Endpoint>, blacklist_duration: Duration) -> Self {
        Self {
            cursor: Mutex::new(Cursor::new(endpoints)),
            blacklist: DashMap::new(),
            blacklist_duration,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a new endpoint set, replacing the old one as a whole
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        let keys: Vec<String> = endpoints.iter().map(Endpoint::key).collect();
        *self.lock() = Cursor::new(endpoints);

        // Forget failures of endpoints that are gone
        self.blacklist.retain(|key, _| keys.contains(key));
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<[Endpoint]> {
        self.lock().snapshot.clone()
    }

    pub fn blacklist_duration(&self) -> Duration {
        self.blacklist_duration
    }

    /// Pick the next eligible endpoint
    pub fn next(&self) -> Option<Endpoint> {
        let now = Instant::now();
        let mut guard = self.lock();
        let Cursor { snapshot, current } = &mut *guard;

        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for (i, endpoint) in snapshot.iter().enumerate() {
            if self.is_blacklisted_at(&endpoint.key(), now) {
                continue;
            }
            let weight = i64::from(endpoint.effective_weight());
            current[i] += weight;
            total += weight;
            if best.is_none_or(|b| current[i] > current[b]) {
                best = Some(i);
            }
        }

        let best = best?;
        current[best] -= total;
        Some(snapshot[best].clone())
    }

    /// Exclude `endpoint` from selection for the blacklist duration
    pub fn mark_failed(&self, endpoint: &Endpoint) {
        let until = Instant::now() + self.blacklist_duration;
        self.blacklist.insert(endpoint.key(), until);

        tracing::warn!(
            endpoint = %endpoint,
            blacklist_secs = self.blacklist_duration.as_secs_f64(),
            "Endpoint blacklisted"
        );
        crate::metrics::record_endpoint_blacklisted(&endpoint.key());
    }

    pub fn is_blacklisted(&self, endpoint: &Endpoint) -> bool {
        self.is_blacklisted_at(&endpoint.key(), Instant::now())
    }

    fn is_blacklisted_at(&self, key: &str, now: Instant) -> bool {
        // Expired entries are dropped lazily
        self.blacklist.remove_if(key, |_, until| now >= *until);
        self.blacklist.contains_key(key)
    }

    /// Snapshot with blacklist state
    pub fn states(&self) -> Vec<EndpointState> {
        let now = Instant::now();
        self.snapshot()
            .iter()
            .map(|endpoint| {
                let remaining = self
                    .blacklist
                    .get(&endpoint.key())
                    .map(|until| *until)
                    .filter(|until| *until > now)
                    .map(|until| until.duration_since(now));

                EndpointState {
                    endpoint: endpoint.clone(),
                    blacklisted: remaining.is_some(),
                    blacklist_remaining_ms: remaining.map(|d| d.as_millis() as u64),
                }
            })
            .collect()
    }
}
