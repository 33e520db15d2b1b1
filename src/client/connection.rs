//! One multiplexed connection to an internal-transport endpoint

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::ClientCodec;
use crate::error::{CodecError, GatewayError, GatewayResult};
use crate::selector::Endpoint;

/// Byte stream a connection can run over
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

type BoxedIo = Box<dyn AsyncIo>;

type ReplySender = oneshot::Sender<GatewayResult<Bytes>>;

/// State shared with the reader task
struct Shared {
    codec: ClientCodec<BoxedIo>,
    // seq -> caller waiting for that response
    pending: DashMap<u64, ReplySender>,
    broken: AtomicBool,
}

/// A connection carrying any number of in-flight calls.
///
/// Calls are correlated by a per-connection sequence number. A single reader
/// task reads every response and hands its body to the caller registered
/// under the response's sequence number; responses nobody waits for any more
/// (the caller timed out) are read and dropped.
pub struct Connection {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Dial `endpoint` over its network
    pub async fn dial(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        max_frame_size: usize,
    ) -> GatewayResult<Self> {
        let io = tokio::time::timeout(connect_timeout, open(endpoint))
            .await
            .map_err(|_| {
                GatewayError::Connection(format!(
                    "timed out connecting to {} after {:?}",
                    endpoint, connect_timeout
                ))
            })??;

        tracing::debug!(endpoint = %endpoint, "Connected to endpoint");

        Ok(Self::from_io(endpoint.clone(), io, max_frame_size))
    }

    /// Run a connection over an already established stream
    pub fn from_io<T>(endpoint: Endpoint, io: T, max_frame_size: usize) -> Self
    where
        T: AsyncIo + 'static,
    {
        let shared = Arc::new(Shared {
            codec: ClientCodec::with_max_frame_size(Box::new(io) as BoxedIo, max_frame_size),
            pending: DashMap::new(),
            broken: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(shared.clone(), endpoint.key()));

        Self {
            endpoint,
            shared,
            next_seq: AtomicU64::new(0),
            reader,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// False once the stream failed; the connection must be replaced
    pub fn is_usable(&self) -> bool {
        !self.shared.broken.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting a response
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send one call and wait for its response.
    ///
    /// Dropping the returned future at any point leaves the connection
    /// usable: the request write always runs to the end of its body frame,
    /// and the pending slot is released.
    pub async fn call(&self, method: &str, args: Bytes, timeout: Duration) -> GatewayResult<Bytes> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(seq, tx);
        let _slot = PendingSlot {
            shared: &self.shared,
            seq,
        };

        // The reader marks the connection broken before failing pending calls,
        // so a call registered after that sweep sees the flag here
        if !self.is_usable() {
            return Err(GatewayError::Connection(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        let shared = self.shared.clone();
        let owned_method = method.to_string();
        let write = tokio::spawn(async move {
            let result = shared.codec.write_request(&owned_method, seq, &args).await;
            if let Err(CodecError::Io(_) | CodecError::ConnectionClosed) = &result {
                shared.broken.store(true, Ordering::SeqCst);
            }
            result
        });

        match write.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                self.shared.broken.store(true, Ordering::SeqCst);
                return Err(GatewayError::Connection(format!(
                    "write to {} did not finish: {}",
                    self.endpoint, e
                )));
            }
        }

        tracing::trace!(endpoint = %self.endpoint, seq, method, "Request written");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(GatewayError::Connection(format!(
                "connection to {} dropped the call",
                self.endpoint
            ))),
            Err(_) => {
                // The slot is abandoned on return; a late response is discarded
                tracing::debug!(endpoint = %self.endpoint, seq, method, "Call timed out");
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    /// Flush and shut down the write side
    pub async fn close(&self) -> GatewayResult<()> {
        self.shared.broken.store(true, Ordering::SeqCst);
        self.shared.codec.close().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Releases a call's pending slot however the call ends
struct PendingSlot<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.seq);
    }
}

async fn open(endpoint: &Endpoint) -> GatewayResult<BoxedIo> {
    let connect_err = |e: std::io::Error| {
        GatewayError::Connection(format!("failed to connect to {}: {}", endpoint, e))
    };

    match endpoint.network.as_str() {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(&endpoint.address)
                .await
                .map_err(connect_err)?;
            stream.set_nodelay(true).map_err(connect_err)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::net::UnixStream::connect(&endpoint.address)
                .await
                .map_err(connect_err)?;
            Ok(Box::new(stream))
        }
        other => Err(GatewayError::Connection(format!(
            "unsupported network '{}' for {}",
            other, endpoint.address
        ))),
    }
}

async fn read_loop(shared: Arc<Shared>, endpoint: String) {
    let err = loop {
        let header = match shared.codec.read_response_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };

        let Some((_, tx)) = shared.pending.remove(&header.seq) else {
            tracing::debug!(
                endpoint = %endpoint,
                seq = header.seq,
                method = %header.method,
                "Discarding response nobody is waiting for"
            );
            if let Err(e) = shared.codec.read_response_body(None).await {
                break e;
            }
            continue;
        };

        let mut body = Bytes::new();
        if let Err(e) = shared.codec.read_response_body(Some(&mut body)).await {
            let _ = tx.send(Err(GatewayError::Connection(e.to_string())));
            break e;
        }

        let reply = if header.error.is_empty() {
            Ok(body)
        } else {
            Err(GatewayError::Remote(header.error))
        };
        // The caller may have given up in the meantime
        let _ = tx.send(reply);
    };

    shared.broken.store(true, Ordering::SeqCst);

    match err {
        CodecError::ConnectionClosed => {
            tracing::debug!(endpoint = %endpoint, "Connection closed by peer")
        }
        ref e => tracing::warn!(endpoint = %endpoint, error = %e, "Connection read failed"),
    }

    let seqs: Vec<u64> = shared.pending.iter().map(|entry| *entry.key()).collect();
    for seq in seqs {
        if let Some((_, tx)) = shared.pending.remove(&seq) {
            let _ = tx.send(Err(GatewayError::Connection(format!(
                "connection to {} lost: {}",
                endpoint, err
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ServerCodec;
    use tokio::io::duplex;

    fn endpoint() -> Endpoint {
        Endpoint::tcp("127.0.0.1:8972")
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client_io, server_io) = duplex(4096);
        let conn = Connection::from_io(endpoint(), client_io, 1 << 20);
        let server = ServerCodec::new(server_io);

        let backend = tokio::spawn(async move {
            let header = server.read_request_header().await.unwrap();
            let mut body = Bytes::new();
            server.read_request_body(Some(&mut body)).await.unwrap();
            server
                .write_response(&header.method, header.seq, None, &body)
                .await
                .unwrap();
        });

        let reply = conn
            .call("Echo.Say", Bytes::from_static(b"hello"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"hello");
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (client_io, server_io) = duplex(4096);
        let conn = Arc::new(Connection::from_io(endpoint(), client_io, 1 << 20));
        let server = ServerCodec::new(server_io);

        let calls: Vec<_> = (0..8u8)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let reply = conn
                        .call("Echo.Say", Bytes::copy_from_slice(&[i; 3]), Duration::from_secs(2))
                        .await
                        .unwrap();
                    (i, reply)
                })
            })
            .collect();

        // Collect all requests, then answer newest first
        let mut requests = Vec::new();
        for _ in 0..8 {
            let header = server.read_request_header().await.unwrap();
            let mut body = Bytes::new();
            server.read_request_body(Some(&mut body)).await.unwrap();
            requests.push((header, body));
        }
        for (header, body) in requests.into_iter().rev() {
            server
                .write_response(&header.method, header.seq, None, &body)
                .await
                .unwrap();
        }

        for call in calls {
            let (i, reply) = call.await.unwrap();
            assert_eq!(&reply[..], &[i; 3]);
        }
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (client_io, server_io) = duplex(4096);
        let conn = Connection::from_io(endpoint(), client_io, 1 << 20);
        let server = ServerCodec::new(server_io);

        tokio::spawn(async move {
            let header = server.read_request_header().await.unwrap();
            server.read_request_body(None).await.unwrap();
            server
                .write_response(&header.method, header.seq, Some("can't find service Nope"), &[])
                .await
                .unwrap();
        });

        let err = conn
            .call("Nope.Call", Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Remote(ref m) if m == "can't find service Nope"));
        // Application errors leave the connection usable
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_timeout_abandons_seq_and_late_reply_is_discarded() {
        let (client_io, server_io) = duplex(4096);
        let conn = Connection::from_io(endpoint(), client_io, 1 << 20);
        let server = ServerCodec::new(server_io);

        let err = conn
            .call("Slow.Call", Bytes::from_static(b"first"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert_eq!(conn.in_flight(), 0);

        let backend = tokio::spawn(async move {
            let slow = server.read_request_header().await.unwrap();
            server.read_request_body(None).await.unwrap();
            let next = server.read_request_header().await.unwrap();
            let mut body = Bytes::new();
            server.read_request_body(Some(&mut body)).await.unwrap();

            // Late answer to the abandoned call first
            server
                .write_response(&slow.method, slow.seq, None, b"late")
                .await
                .unwrap();
            server
                .write_response(&next.method, next.seq, None, &body)
                .await
                .unwrap();
            server
        });

        let reply = conn
            .call("Fast.Call", Bytes::from_static(b"second"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"second");
        assert!(conn.is_usable());
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_and_marks_broken() {
        let (client_io, server_io) = duplex(4096);
        let conn = Connection::from_io(endpoint(), client_io, 1 << 20);
        let server = ServerCodec::new(server_io);

        let backend = tokio::spawn(async move {
            server.read_request_header().await.unwrap();
            server.read_request_body(None).await.unwrap();
            drop(server);
        });

        let err = conn
            .call("Echo.Say", Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        backend.await.unwrap();
        assert!(!conn.is_usable());

        let err = conn
            .call("Echo.Say", Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_call_leaves_stream_framed() {
        // The pipe holds 1 KiB, so the large body stalls until the server reads
        let (client_io, server_io) = duplex(1024);
        let conn = Arc::new(Connection::from_io(endpoint(), client_io, 1 << 20));
        let server = ServerCodec::new(server_io);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            conn.call(
                "Big.Call",
                Bytes::from(vec![0xAA; 64 * 1024]),
                Duration::from_secs(5),
            ),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(conn.in_flight(), 0);

        let next = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.call("Small.Call", Bytes::from_static(b"hi"), Duration::from_secs(5))
                    .await
            })
        };

        let big = server.read_request_header().await.unwrap();
        assert_eq!(big.method, "Big.Call");
        let mut body = Bytes::new();
        server.read_request_body(Some(&mut body)).await.unwrap();
        assert_eq!(body.len(), 64 * 1024);

        let small = server.read_request_header().await.unwrap();
        assert_eq!(small.method, "Small.Call");
        let mut body = Bytes::new();
        server.read_request_body(Some(&mut body)).await.unwrap();
        server
            .write_response(&small.method, small.seq, None, &body)
            .await
            .unwrap();

        let reply = next.await.unwrap().unwrap();
        assert_eq!(&reply[..], b"hi");
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_pending_slot() {
        let (client_io, server_io) = duplex(4096);
        let conn = Connection::from_io(endpoint(), client_io, 1 << 20);
        let _server = ServerCodec::new(server_io);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            conn.call("Slow.Call", Bytes::from_static(b"x"), Duration::from_secs(5)),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(conn.in_flight(), 0);
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let endpoint = Endpoint::new("quic", "127.0.0.1:1");
        let err = Connection::dial(&endpoint, Duration::from_secs(1), 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Connection(_)));
    }
}
