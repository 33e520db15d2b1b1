//! Wire Gateway - gRPC front door for framed internal RPC services
//!
//! Accepts `Call(name, data)` over gRPC and forwards the payload bytes,
//! untouched, to services speaking a length-prefixed binary protocol.
//! Endpoints come from a fixed address, a static weighted list, or a
//! discovery backend (ZooKeeper, etcd v3, Consul).

pub mod admin;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod selector;

pub use client::{ClientOptions, InternalClient};
pub use config::GatewayConfig;
pub use error::{CodecError, DiscoveryError, GatewayError, GatewayResult};
pub use gateway::{Gateway, StopHandle};
pub use selector::{Endpoint, EndpointSelector, Selector, SelectorConfig};
