//! Error taxonomy shared by the codec, selectors, dispatcher and gateway

use std::time::Duration;
use thiserror::Error;
use tonic::Status;

/// Framing and header errors raised by the wire codec
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode header: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Failed to encode header: {0}")]
    Encoding(String),
}

/// Errors reported by discovery backends
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to connect to discovery backend: {0}")]
    Connect(String),

    #[error("Discovery backend error: {0}")]
    Backend(String),

    #[error("Invalid registration '{key}': {reason}")]
    InvalidRegistration { key: String, reason: String },
}

/// Errors surfaced by the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The callee's own error message, passed through verbatim
    #[error("{0}")]
    Remote(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid service method '{0}', expected \"Service.Method\"")]
    InvalidServiceMethod(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(String),
}

impl GatewayError {
    /// Whether the dispatcher may retry the call on another endpoint
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Connection(_) => "connection",
            GatewayError::Encoding(_) => "encoding",
            GatewayError::Remote(_) => "remote",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::InvalidServiceMethod(_) => "invalid_method",
            GatewayError::Discovery(_) => "discovery",
            GatewayError::Bind { .. } => "bind",
            GatewayError::Serve(_) => "serve",
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::FrameTooLarge { .. } | CodecError::Encoding(_) => {
                GatewayError::Encoding(err.to_string())
            }
            CodecError::Io(_) | CodecError::Decode(_) | CodecError::ConnectionClosed => {
                GatewayError::Connection(err.to_string())
            }
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::Remote(_) => Status::unknown(message),
            GatewayError::Connection(_) | GatewayError::Discovery(_) => {
                Status::unavailable(message)
            }
            GatewayError::Timeout(_) => Status::deadline_exceeded(message),
            GatewayError::Encoding(_) | GatewayError::InvalidServiceMethod(_) => {
                Status::invalid_argument(message)
            }
            GatewayError::Config(_) | GatewayError::Bind { .. } | GatewayError::Serve(_) => {
                Status::internal(message)
            }
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
