//! RPC error taxonomy.

use plexrpc_protocol::{ErrorCode, ResponseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sub-kind of a handler failure, surfaced from the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Conflict,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::NotFound => "not found",
            FailureKind::Conflict => "conflict",
            FailureKind::Internal => "internal",
        })
    }
}

/// Errors surfaced by routing, the controller lifecycle and dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("no handler for {service}.{method} on {transport}")]
    RoutingNotFound {
        service: String,
        method: String,
        transport: String,
    },

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("handler failed ({kind}): {message}")]
    HandlerFailed { kind: FailureKind, message: String },

    #[error("peer unreachable: {peer}: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("duplicate registration: {service}.{method} on {transport}")]
    DuplicateRegistration {
        service: String,
        method: String,
        transport: String,
    },
}

impl RpcError {
    pub fn routing_not_found(
        service: impl Into<String>,
        method: impl Into<String>,
        transport: impl fmt::Display,
    ) -> Self {
        RpcError::RoutingNotFound {
            service: service.into(),
            method: method.into(),
            transport: transport.to_string(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        RpcError::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::HandlerFailed {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }

    pub fn unreachable(peer: impl fmt::Display, reason: impl Into<String>) -> Self {
        RpcError::PeerUnreachable {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the stable code this error travels under.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RpcError::RoutingNotFound { .. } => ErrorCode::RoutingNotFound,
            RpcError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            RpcError::HandlerFailed { kind, .. } => match kind {
                FailureKind::NotFound => ErrorCode::NotFound,
                FailureKind::Conflict => ErrorCode::Conflict,
                FailureKind::Internal => ErrorCode::HandlerFailed,
            },
            RpcError::PeerUnreachable { .. } => ErrorCode::PeerUnreachable,
            RpcError::DuplicateRegistration { .. } => ErrorCode::DuplicateRegistration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Replaces handler failure details with a generic message.
    pub fn masked(self) -> Self {
        match self {
            RpcError::HandlerFailed { kind, .. } => RpcError::HandlerFailed {
                kind,
                message: "request failed".to_string(),
            },
            other => other,
        }
    }

    /// Converts into the wire representation.
    pub fn to_response_error(&self) -> ResponseError {
        let error = ResponseError::new(self.error_code(), self.to_string());
        match self {
            RpcError::RoutingNotFound {
                service,
                method,
                transport,
            }
            | RpcError::DuplicateRegistration {
                service,
                method,
                transport,
            } => error
                .with_detail("service", service.as_str())
                .with_detail("method", method.as_str())
                .with_detail("transport", transport.as_str()),
            RpcError::ValidationFailed { reason } => error.with_detail("reason", reason.as_str()),
            RpcError::HandlerFailed { message, .. } => {
                error.with_detail("reason", message.as_str())
            }
            RpcError::PeerUnreachable { peer, reason } => error
                .with_detail("peer", peer.as_str())
                .with_detail("reason", reason.as_str()),
        }
    }

    /// Rebuilds the error category from a wire error.
    pub fn from_response_error(error: &ResponseError) -> Self {
        let detail = |key: &str| {
            error
                .detail_str(key)
                .map(str::to_string)
                .unwrap_or_else(|| error.message.clone())
        };
        let field = |key: &str| error.detail_str(key).unwrap_or_default().to_string();

        match error.code {
            ErrorCode::RoutingNotFound => RpcError::RoutingNotFound {
                service: field("service"),
                method: field("method"),
                transport: field("transport"),
            },
            ErrorCode::DuplicateRegistration => RpcError::DuplicateRegistration {
                service: field("service"),
                method: field("method"),
                transport: field("transport"),
            },
            ErrorCode::ValidationFailed
            | ErrorCode::BadRequest
            | ErrorCode::UnsupportedProtocol => RpcError::ValidationFailed {
                reason: detail("reason"),
            },
            ErrorCode::NotFound => RpcError::HandlerFailed {
                kind: FailureKind::NotFound,
                message: detail("reason"),
            },
            ErrorCode::Conflict => RpcError::HandlerFailed {
                kind: FailureKind::Conflict,
                message: detail("reason"),
            },
            ErrorCode::HandlerFailed | ErrorCode::InternalError => RpcError::HandlerFailed {
                kind: FailureKind::Internal,
                message: detail("reason"),
            },
            ErrorCode::PeerUnreachable => RpcError::PeerUnreachable {
                peer: field("peer"),
                reason: detail("reason"),
            },
        }
    }
}

/// Failure raised by `Controller::setup`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Argument count mismatch.
    pub fn arity(expected: usize, actual: usize) -> Self {
        Self::new(format!("expected {} argument(s), got {}", expected, actual))
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("invalid argument: {}", e))
    }
}

impl From<ValidationError> for RpcError {
    fn from(e: ValidationError) -> Self {
        RpcError::ValidationFailed { reason: e.reason }
    }
}

/// Failure raised by `Controller::handle`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotFound,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Conflict,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<HandlerError> for RpcError {
    fn from(e: HandlerError) -> Self {
        RpcError::HandlerFailed {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Errors from config-driven registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Registration(#[from] RpcError),

    #[error("no controller named {service}.{method} in catalog")]
    UnknownController { service: String, method: String },

    #[error("binding {service}.{method} lists no transports")]
    NoTransports { service: String, method: String },
}
