//! Client error types.

use plexrpc_core::RpcError;
use plexrpc_protocol::{ErrorCode, Response, ResponseError};
use serde_json::Value;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] plexrpc_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {} - {}", .0.code, .0.message)]
    ServerError(ResponseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::ServerError(err) => err.retryable,
            _ => false,
        }
    }

    /// Returns the server error code, if the server answered with an error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::ServerError(err) => Some(err.code),
            _ => None,
        }
    }

    /// Unwraps a response into its result value.
    pub fn check(response: Response) -> Result<Value, ClientError> {
        match response.error {
            Some(err) => Err(ClientError::ServerError(err)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Maps into the RPC taxonomy. Transport failures become
    /// `PeerUnreachable` for `peer`.
    pub fn into_rpc_error(self, peer: impl std::fmt::Display) -> RpcError {
        match self {
            ClientError::ServerError(err) => RpcError::from_response_error(&err),
            ClientError::Io(_)
            | ClientError::NotConnected
            | ClientError::ConnectionClosed
            | ClientError::Timeout => RpcError::unreachable(peer, self.to_string()),
            ClientError::Protocol(_) | ClientError::Json(_) => RpcError::internal(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_are_unreachable() {
        let err = ClientError::Timeout.into_rpc_error("10.0.0.9:7411");
        assert_eq!(err, RpcError::unreachable("10.0.0.9:7411", "request timeout"));
        assert!(ClientError::ConnectionClosed.is_retryable());
    }

    #[test]
    fn test_server_error_keeps_category() {
        let wire = RpcError::validation("expected 1 argument(s), got 2").to_response_error();
        let err = ClientError::ServerError(wire);
        assert_eq!(err.code(), Some(ErrorCode::ValidationFailed));
        assert!(!err.is_retryable());
        assert_eq!(
            err.into_rpc_error("b"),
            RpcError::validation("expected 1 argument(s), got 2")
        );
    }

    #[test]
    fn test_check_response() {
        let ok = Response::ok("1", serde_json::json!("pong"));
        assert_eq!(ClientError::check(ok).unwrap(), serde_json::json!("pong"));

        let err = Response::error("2", ResponseError::new(ErrorCode::NotFound, "gone"));
        assert!(matches!(
            ClientError::check(err),
            Err(ClientError::ServerError(_))
        ));
    }
}
