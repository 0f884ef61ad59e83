//! # plexrpc-cluster
//!
//! Cluster membership and node capability exchange for plexrpc.
//!
//! This crate provides:
//! - The group transport seam and an in-process group
//! - Cluster messages (`GetNodeConfiguration`, `OnNodeConfiguration`, one-way
//!   invocations) encoded as PXP frames
//! - The capability exchange maintaining the peer table

pub mod error;
pub mod exchange;
pub mod local;
pub mod message;
pub mod transport;

pub use error::ClusterError;
pub use exchange::{
    ClusterExchange, ExchangeConfig, InboundInvocation, PeerEntry, PeerState, PeerTable,
};
pub use local::{LocalGroup, LocalMember};
pub use message::{ClusterMessage, Envelope};
pub use transport::{GroupEvent, GroupTransport, MembershipEvent};
