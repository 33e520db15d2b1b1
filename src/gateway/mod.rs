//! gRPC front door
//!
//! Accepts `gateway.v1.Gateway/Call` and hands the opaque payload to the
//! internal client untouched. The reply bytes come back the same way.

pub mod server;
pub mod service;

pub use server::{Gateway, StopHandle};
pub use service::GatewayService;

// Include generated proto code
pub mod proto {
    pub mod gateway {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/gateway.v1.rs"));
        }
    }
}
