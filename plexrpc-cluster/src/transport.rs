//! Group transport seam.

use crate::error::ClusterError;
use bytes::Bytes;
use plexrpc_protocol::NodeAddress;

/// Membership change observed by a group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeAddress),
    Departed(NodeAddress),
}

/// Event delivered to a group member, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    Membership(MembershipEvent),
    /// An encoded cluster frame.
    Message(Bytes),
}

/// Group communication used by the capability exchange.
///
/// Sends only enqueue; they never wait for the receiver.
pub trait GroupTransport: Send + Sync {
    /// Address of this member.
    fn local_address(&self) -> &NodeAddress;

    /// Current members other than this one.
    fn members(&self) -> Vec<NodeAddress>;

    fn send(&self, to: &NodeAddress, frame: Bytes) -> Result<(), ClusterError>;

    /// Sends to every other member.
    fn broadcast(&self, frame: Bytes) -> Result<(), ClusterError> {
        for member in self.members() {
            if let Err(e) = self.send(&member, frame.clone()) {
                tracing::warn!("Broadcast to {} failed: {}", member, e);
            }
        }
        Ok(())
    }
}
