//! Shared fixtures: in-process framed backends and a running gateway

#![allow(dead_code)]

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use wire_gateway::codec::ServerCodec;
use wire_gateway::gateway::proto::gateway::v1::gateway_client::GatewayClient;
use wire_gateway::{Endpoint, Gateway, GatewayConfig, StopHandle};

/// Handler deciding a backend's reply to `(method, body)`
pub type Handler = Arc<dyn Fn(&str, Bytes) -> Result<Bytes, String> + Send + Sync>;

/// A framed backend listening on localhost
pub struct Backend {
    pub addr: SocketAddr,
    pub served: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Backend {
    pub async fn spawn(handler: Handler) -> Self {
        Self::spawn_with_delay(handler, Duration::ZERO).await
    }

    /// Backend that sleeps before answering each request
    pub async fn spawn_with_delay(handler: Handler, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let codec = ServerCodec::new(stream);
                    while let Ok(header) = codec.read_request_header().await {
                        let mut body = Bytes::new();
                        if codec.read_request_body(Some(&mut body)).await.is_err() {
                            break;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let written = match handler(&header.method, body) {
                            Ok(reply) => {
                                codec
                                    .write_response(&header.method, header.seq, None, &reply)
                                    .await
                            }
                            Err(message) => {
                                codec
                                    .write_response(&header.method, header.seq, Some(&message), &[])
                                    .await
                            }
                        };
                        if written.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { addr, served, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.addr.to_string())
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Replies with the body unchanged
pub fn echo() -> Handler {
    Arc::new(|_, body| Ok(body))
}

/// Replies with the body length as one byte, then the body
pub fn echo_with_length() -> Handler {
    Arc::new(|_, body| {
        let mut reply = Vec::with_capacity(body.len() + 1);
        reply.push(body.len() as u8);
        reply.extend_from_slice(&body);
        Ok(Bytes::from(reply))
    })
}

/// Always fails with `message`
pub fn failing(message: &'static str) -> Handler {
    Arc::new(move |_, _| Err(message.to_string()))
}

/// An address nothing listens on
pub async fn dead_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Gateway config bound to an ephemeral port
pub fn gateway_config(kind: &str, opts: &[String]) -> GatewayConfig {
    let mut config = GatewayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    config.registry.kind = kind.to_string();
    config.registry.opts = opts.to_vec();
    config.client.connect_timeout_ms = 1_000;
    config.client.call_timeout_ms = 2_000;
    config
}

/// A gateway serving in the background
pub struct RunningGateway {
    pub addr: SocketAddr,
    pub stop: StopHandle,
    pub task: JoinHandle<wire_gateway::GatewayResult<()>>,
}

impl RunningGateway {
    pub async fn start(gateway: Gateway) -> Self {
        let addr = gateway.local_addr().unwrap();
        let stop = gateway.stop_handle();
        let task = tokio::spawn(gateway.serve());
        Self { addr, stop, task }
    }

    pub async fn from_config(config: &GatewayConfig) -> Self {
        Self::start(Gateway::bind(config).await.unwrap()).await
    }

    pub async fn client(&self) -> GatewayClient<Channel> {
        // Server task may not be accepting yet
        for _ in 0..50 {
            if let Ok(client) = GatewayClient::connect(format!("http://{}", self.addr)).await {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("gateway at {} never accepted connections", self.addr);
    }
}
