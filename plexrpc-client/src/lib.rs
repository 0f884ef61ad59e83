//! # plexrpc-client
//!
//! Client library for plexrpc.
//!
//! This crate provides:
//! - Async TCP client speaking PXP with request correlation and timeouts
//! - Typed service proxies over hand-written interface adapters
//! - Dispatch strategies: blocking round trip, one-way queue publish and
//!   cluster broadcast

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod proxy;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use dispatch::{
    BlockingDispatch, BroadcastDispatch, DispatchMode, DispatchOutcome, InvocationCallback,
    OneWayDispatch, PeerResolver, QueueRouter, ServiceQueueRouter, Target,
};
pub use error::ClientError;
pub use proxy::{MethodSignature, ProxyBuilder, ProxyError, ReturnKind, ServiceInterface, ServiceProxy};
