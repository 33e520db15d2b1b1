//! Gateway service implementation - forwards calls to the internal transport

use bytes::Bytes;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{Span, instrument};

use super::proto::gateway::v1::gateway_server::Gateway as GatewayRpc;
use super::proto::gateway::v1::{CallReply, CallRequest};
use crate::client::InternalClient;

/// Gateway service implementation
#[derive(Clone)]
pub struct GatewayService {
    client: Arc<InternalClient>,
}

impl GatewayService {
    pub fn new(client: Arc<InternalClient>) -> Self {
        Self { client }
    }
}

#[tonic::async_trait]
impl GatewayRpc for GatewayService {
    #[instrument(skip(self, request), fields(method, payload_len))]
    async fn call(&self, request: Request<CallRequest>) -> Result<Response<CallReply>, Status> {
        let req = request.into_inner();

        Span::current()
            .record("method", req.name.as_str())
            .record("payload_len", req.data.len());

        // Payload is opaque: no decode, no re-encode
        let reply = self.client.call(&req.name, Bytes::from(req.data)).await?;

        Ok(Response::new(CallReply { data: reply.into() }))
    }
}
