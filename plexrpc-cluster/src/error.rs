//! Cluster error types.

use plexrpc_protocol::{NodeAddress, Operation, ProtocolError};
use thiserror::Error;

/// Errors from the group transport and the capability exchange.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not a group member: {0}")]
    UnknownMember(NodeAddress),

    #[error("group transport closed")]
    Closed,

    #[error("truncated cluster frame")]
    TruncatedFrame,

    #[error("unexpected operation on group transport: {}", .0.as_str())]
    UnexpectedOperation(Operation),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
