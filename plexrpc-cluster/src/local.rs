//! In-process group used for single-host clusters and tests.

use crate::error::ClusterError;
use crate::transport::{GroupEvent, GroupTransport, MembershipEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use plexrpc_protocol::NodeAddress;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<GroupEvent>;

/// A group whose members live in the same process.
///
/// A joining member is announced to everyone already present and receives a
/// `Joined` event for each of them. Events to one member arrive in the order
/// they were produced.
#[derive(Default)]
pub struct LocalGroup {
    members: Mutex<BTreeMap<NodeAddress, EventSender>>,
}

impl LocalGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member and returns its handle and event stream.
    pub fn join(
        self: &Arc<Self>,
        address: NodeAddress,
    ) -> (LocalMember, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut members = self.members.lock();

        for (existing, sender) in members.iter() {
            let _ = sender.send(GroupEvent::Membership(MembershipEvent::Joined(
                address.clone(),
            )));
            let _ = tx.send(GroupEvent::Membership(MembershipEvent::Joined(
                existing.clone(),
            )));
        }
        members.insert(address.clone(), tx);
        tracing::debug!("{} joined local group ({} members)", address, members.len());

        let member = LocalMember {
            group: self.clone(),
            address,
        };
        (member, rx)
    }

    /// Removes a member and announces the departure.
    pub fn leave(&self, address: &NodeAddress) {
        let mut members = self.members.lock();
        if members.remove(address).is_none() {
            return;
        }
        for sender in members.values() {
            let _ = sender.send(GroupEvent::Membership(MembershipEvent::Departed(
                address.clone(),
            )));
        }
        tracing::debug!("{} left local group", address);
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

/// One member's view of a [`LocalGroup`].
#[derive(Clone)]
pub struct LocalMember {
    group: Arc<LocalGroup>,
    address: NodeAddress,
}

impl LocalMember {
    /// Leaves the group.
    pub fn leave(&self) {
        self.group.leave(&self.address);
    }
}

impl GroupTransport for LocalMember {
    fn local_address(&self) -> &NodeAddress {
        &self.address
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.group
            .members
            .lock()
            .keys()
            .filter(|a| **a != self.address)
            .cloned()
            .collect()
    }

    fn send(&self, to: &NodeAddress, frame: Bytes) -> Result<(), ClusterError> {
        let members = self.group.members.lock();
        let sender = members
            .get(to)
            .ok_or_else(|| ClusterError::UnknownMember(to.clone()))?;
        sender
            .send(GroupEvent::Message(frame))
            .map_err(|_| ClusterError::Closed)
    }
}
