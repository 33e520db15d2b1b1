//! gRPC server initialization and lifecycle management

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use super::proto::gateway::v1::gateway_server::GatewayServer;
use super::service::GatewayService;
use crate::client::InternalClient;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::selector::Selector;

/// A bound gateway, ready to serve
pub struct Gateway {
    listener: TcpListener,
    client: Arc<InternalClient>,
    max_message_size: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Stops a running [`Gateway`] gracefully
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl Gateway {
    /// Build the selector and client, then bind the listener.
    ///
    /// An invalid registry configuration fails before anything is bound.
    pub async fn bind(config: &GatewayConfig) -> GatewayResult<Self> {
        let selector = Selector::from_config(config.selector_config()?).await?;
        tracing::info!(
            registry = %config.registry.kind,
            selector = selector.name(),
            "Selector ready"
        );

        let client = InternalClient::new(Arc::new(selector), config.client.options());

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        Ok(Self::from_parts(
            listener,
            Arc::new(client),
            config.max_message_size(),
        ))
    }

    /// Assemble a gateway from an already bound listener
    pub fn from_parts(
        listener: TcpListener,
        client: Arc<InternalClient>,
        max_message_size: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            listener,
            client,
            max_message_size,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn local_addr(&self) -> GatewayResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| GatewayError::Serve(e.to_string()))
    }

    pub fn client(&self) -> Arc<InternalClient> {
        self.client.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve until [`StopHandle::stop`] is called
    pub async fn serve(self) -> GatewayResult<()> {
        let addr = self.local_addr()?;
        let service = GatewayService::new(self.client);

        // Enable gRPC reflection
        let file_descriptor_set: &[u8] = tonic::include_file_descriptor_set!("descriptor");
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(file_descriptor_set)
            .build_v1()
            .map_err(|e| GatewayError::Serve(e.to_string()))?;

        tracing::info!(
            addr = %addr,
            max_message_bytes = self.max_message_size,
            "Starting gRPC gateway"
        );

        let mut shutdown_rx = self.shutdown_rx;
        let shutdown = async move {
            // Sender lives in self and every StopHandle, so this only ends on stop()
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
            tracing::info!("Gateway shutting down");
        };

        Server::builder()
            .add_service(
                GatewayServer::new(service)
                    .max_decoding_message_size(self.max_message_size)
                    .max_encoding_message_size(self.max_message_size),
            )
            .add_service(reflection_service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), shutdown)
            .await
            .map_err(|e| GatewayError::Serve(e.to_string()))?;

        Ok(())
    }
}
