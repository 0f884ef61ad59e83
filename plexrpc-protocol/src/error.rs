//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'PLXR', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("origin header too long: {0} bytes")]
    OriginTooLong(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Stable error codes returned in error responses.
///
/// Every category of the RPC error taxonomy has its own code so the receiving
/// side can rebuild the category regardless of the transport that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,

    // Routing
    RoutingNotFound,
    DuplicateRegistration,

    // Controller lifecycle
    ValidationFailed,
    HandlerFailed,
    NotFound,
    Conflict,

    // Delivery
    PeerUnreachable,
    InternalError,
}

impl ErrorCode {
    /// Returns whether this error is potentially retryable.
    ///
    /// Only delivery failures qualify; routing and validation failures are
    /// never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::PeerUnreachable | ErrorCode::InternalError)
    }

    /// Returns whether the failure was caused by the caller.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnsupportedProtocol
                | ErrorCode::BadRequest
                | ErrorCode::RoutingNotFound
                | ErrorCode::ValidationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::RoutingNotFound => "ROUTING_NOT_FOUND",
            ErrorCode::DuplicateRegistration => "DUPLICATE_REGISTRATION",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::HandlerFailed => "HANDLER_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PeerUnreachable => "PEER_UNREACHABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
