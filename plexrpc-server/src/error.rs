//! Server error types.

use crate::config::ConfigError;
use plexrpc_client::ClientError;
use plexrpc_cluster::ClusterError;
use plexrpc_core::{QueueError, RegistryError};
use plexrpc_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] plexrpc_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("peer link error: {0}")]
    Client(#[from] ClientError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("handshake required before {0}")]
    HandshakeRequired(&'static str),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(_)
            | ServerError::Json(_)
            | ServerError::InvalidRequest(_)
            | ServerError::HandshakeRequired(_) => ErrorCode::BadRequest,
            ServerError::Registry(RegistryError::Registration(e)) => e.error_code(),
            _ => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}
