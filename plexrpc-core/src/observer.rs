//! Completion hook for the observability collaborator.

use crate::transport::TransportKind;
use plexrpc_protocol::ErrorCode;
use std::time::Duration;

/// Outcome of one completed call, as reported to observers.
#[derive(Debug, Clone, Copy)]
pub struct CompletedRequest<'a> {
    pub transport: TransportKind,
    pub service: &'a str,
    pub method: &'a str,
    pub elapsed: Duration,
    /// `None` on success.
    pub error: Option<ErrorCode>,
}

/// Notified once for every completed call. Must not block.
pub trait RequestObserver: Send + Sync {
    fn request_completed(&self, request: &CompletedRequest<'_>);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RequestObserver for NoopObserver {
    fn request_completed(&self, _request: &CompletedRequest<'_>) {}
}
