//! Internal transport client
//!
//! [`InternalClient::call`] is the single entry point the gateway uses: pick
//! an endpoint, borrow its pooled connection, send the opaque payload and
//! wait for the correlated reply. Connection-level failures blacklist the
//! endpoint and the call moves on to the next candidate.

pub mod connection;
pub mod pool;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub use connection::Connection;
pub use pool::{ConnectionPool, PoolStats};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{GatewayError, GatewayResult};
use crate::selector::{Endpoint, EndpointSelector, Selector};

/// Dispatcher tunables
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Total attempts per call, across endpoints
    pub retries: usize,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            call_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Check the `Service.Method` shape
pub fn validate_service_method(service_method: &str) -> GatewayResult<()> {
    match service_method.split_once('.') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('.') =>
        {
            Ok(())
        }
        _ => Err(GatewayError::InvalidServiceMethod(
            service_method.to_string(),
        )),
    }
}

/// Client for services on the internal transport
pub struct InternalClient {
    selector: Arc<Selector>,
    pool: ConnectionPool,
    options: ClientOptions,
}

impl InternalClient {
    pub fn new(selector: Arc<Selector>, options: ClientOptions) -> Self {
        let pool = ConnectionPool::new(options.connect_timeout, options.max_frame_size);
        Self {
            selector,
            pool,
            options,
        }
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Drop pooled connections to endpoints the selector no longer knows
    fn prune_connections(&self) {
        if self.pool.is_empty() {
            return;
        }
        let live: Vec<Endpoint> = self
            .selector
            .endpoints()
            .into_iter()
            .map(|state| state.endpoint)
            .collect();
        self.pool.retain_endpoints(&live);
    }

    /// Invoke `service_method` with an already serialized payload and return
    /// the callee's serialized reply.
    pub async fn call(&self, service_method: &str, args: Bytes) -> GatewayResult<Bytes> {
        validate_service_method(service_method)?;
        crate::metrics::record_call();

        let result = self.dispatch(service_method, args).await;
        if let Err(e) = &result {
            crate::metrics::record_call_failure(e.kind());
        }
        result
    }

    async fn dispatch(&self, service_method: &str, args: Bytes) -> GatewayResult<Bytes> {
        let attempts = self.options.retries.max(1);
        let mut last_err = None;

        self.prune_connections();

        for attempt in 1..=attempts {
            let Some(endpoint) = self.selector.next() else {
                last_err = Some(GatewayError::Connection(
                    "no endpoint available".to_string(),
                ));
                continue;
            };

            let (conn, result) = match self.pool.get(&endpoint).await {
                Ok(conn) => {
                    let result = conn
                        .call(service_method, args.clone(), self.options.call_timeout)
                        .await;
                    (Some(conn), result)
                }
                Err(e) => (None, Err(e)),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        method = service_method,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Call failed on endpoint"
                    );
                    self.selector.mark_failed(&endpoint);
                    // A connection another caller has since dialed stays pooled
                    if let Some(conn) = &conn {
                        self.pool.evict_connection(conn);
                    }
                    if attempt < attempts {
                        crate::metrics::record_retry(&endpoint.key());
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Connection("no attempt made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ServerCodec;
    use crate::selector::{SelectPolicy, SelectorConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Echo backend counting the requests it served
    async fn spawn_echo_backend() -> (Endpoint, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp(listener.local_addr().unwrap().to_string());
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let codec = ServerCodec::new(stream);
                    while let Ok(header) = codec.read_request_header().await {
                        let mut body = Bytes::new();
                        if codec.read_request_body(Some(&mut body)).await.is_err() {
                            break;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        let error = (header.method == "Echo.Fail").then_some("failed on purpose");
                        if codec
                            .write_response(&header.method, header.seq, error, &body)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });

        (endpoint, served)
    }

    async fn dead_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Endpoint::tcp(listener.local_addr().unwrap().to_string())
    }

    async fn client_for(endpoints: Vec<Endpoint>, retries: usize) -> InternalClient {
        let selector = Selector::from_config(SelectorConfig::StaticMultiple {
            endpoints,
            blacklist_duration: Duration::from_secs(60),
            policy: SelectPolicy::WeightedRoundRobin,
        })
        .await
        .unwrap();

        InternalClient::new(
            Arc::new(selector),
            ClientOptions {
                retries,
                call_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_validate_service_method() {
        assert!(validate_service_method("Arith.Mul").is_ok());
        assert!(validate_service_method("Arith").is_err());
        assert!(validate_service_method(".Mul").is_err());
        assert!(validate_service_method("Arith.").is_err());
        assert!(validate_service_method("a.b.c").is_err());
    }

    #[tokio::test]
    async fn test_call_returns_reply_unchanged() {
        let (endpoint, served) = spawn_echo_backend().await;
        let client = client_for(vec![endpoint], 3).await;

        let payload = Bytes::from_static(&[0, 159, 146, 150, 255]);
        let reply = client.call("Echo.Say", payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_method_is_not_sent() {
        let (endpoint, served) = spawn_echo_backend().await;
        let client = client_for(vec![endpoint], 3).await;

        let err = client.call("NoDot", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidServiceMethod(_)));
        assert_eq!(served.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_next_endpoint_after_connection_failure() {
        let dead = dead_endpoint().await;
        let (alive, served) = spawn_echo_backend().await;
        let client = client_for(vec![dead.clone(), alive], 3).await;

        let reply = client.call("Echo.Say", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&reply[..], b"hi");
        assert_eq!(served.load(Ordering::SeqCst), 1);

        let dead_state = client
            .selector()
            .endpoints()
            .into_iter()
            .find(|s| s.endpoint == dead)
            .unwrap();
        assert!(dead_state.blacklisted);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let client = client_for(
            vec![dead_endpoint().await, dead_endpoint().await, dead_endpoint().await],
            2,
        )
        .await;

        let err = client.call("Echo.Say", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));

        // Two attempts blacklisted two endpoints, the third is untouched
        let blacklisted = client
            .selector()
            .endpoints()
            .iter()
            .filter(|s| s.blacklisted)
            .count();
        assert_eq!(blacklisted, 2);
    }

    #[tokio::test]
    async fn test_remote_error_not_retried() {
        let (a, served_a) = spawn_echo_backend().await;
        let (b, served_b) = spawn_echo_backend().await;
        let client = client_for(vec![a, b], 3).await;

        let err = client
            .call("Echo.Fail", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Remote(ref m) if m == "failed on purpose"));
        assert_eq!(
            served_a.load(Ordering::SeqCst) + served_b.load(Ordering::SeqCst),
            1
        );
        assert!(client.selector().endpoints().iter().all(|s| !s.blacklisted));
    }

    #[tokio::test]
    async fn test_no_endpoint_available() {
        let dead = dead_endpoint().await;
        let client = client_for(vec![dead.clone()], 1).await;
        client.selector().mark_failed(&dead);

        let err = client.call("Echo.Say", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(ref m) if m.contains("no endpoint")));
    }

    #[tokio::test]
    async fn test_connections_to_removed_endpoints_are_pruned() {
        let (a, _) = spawn_echo_backend().await;
        let (b, _) = spawn_echo_backend().await;
        let discovery = Arc::new(crate::selector::MemoryDiscovery::new(vec![a.clone(), b.clone()]));
        let selector = Selector::with_discovery(
            discovery.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let client = InternalClient::new(Arc::new(selector), ClientOptions::default());

        client.call("Echo.Say", Bytes::new()).await.unwrap();
        client.call("Echo.Say", Bytes::new()).await.unwrap();
        assert_eq!(client.pool().len(), 2);

        discovery.set_quietly(vec![b.clone()]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.selector().endpoints().len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.call("Echo.Say", Bytes::new()).await.unwrap();
        assert_eq!(client.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_swapped_endpoint_connection_is_pruned() {
        let (a, _) = spawn_echo_backend().await;
        let (b, served_b) = spawn_echo_backend().await;
        let discovery = Arc::new(crate::selector::MemoryDiscovery::new(vec![a.clone()]));
        let selector = Selector::with_discovery(
            discovery.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let client = InternalClient::new(Arc::new(selector), ClientOptions::default());

        client.call("Echo.Say", Bytes::new()).await.unwrap();
        let a_conn = client.pool().get(&a).await.unwrap();

        // Same size, different member
        discovery.set_quietly(vec![b.clone()]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.selector().endpoints()[0].endpoint != b {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.call("Echo.Say", Bytes::new()).await.unwrap();
        assert_eq!(served_b.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool().len(), 1);
        assert!(!client.pool().evict_connection(&a_conn));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_connection() {
        let (endpoint, served) = spawn_echo_backend().await;
        let client = Arc::new(client_for(vec![endpoint], 3).await);

        let calls: Vec<_> = (0..50u32)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let payload = Bytes::from(i.to_be_bytes().to_vec());
                    let reply = client.call("Echo.Say", payload.clone()).await.unwrap();
                    assert_eq!(reply, payload);
                })
            })
            .collect();

        for call in futures::future::join_all(calls).await {
            call.unwrap();
        }
        assert_eq!(served.load(Ordering::SeqCst), 50);
        assert_eq!(client.pool().stats().active_connections, 1);
    }
}
