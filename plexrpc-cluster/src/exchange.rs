//! Node capability exchange.
//!
//! Each peer moves through `Unknown -> AwaitingSnapshot -> Known`:
//!
//! - a join puts the peer in `AwaitingSnapshot` and sends it
//!   `GetNodeConfiguration`;
//! - a snapshot from the peer, solicited or pushed, makes it `Known` and
//!   replaces its peer-table entry;
//! - a departure removes the peer from every state.
//!
//! Snapshots from addresses that are not current members are dropped, so a
//! late response never brings back a departed peer. A peer that never
//! answers simply stays out of the table.

use crate::error::ClusterError;
use crate::message::{ClusterMessage, Envelope};
use crate::transport::{GroupEvent, GroupTransport, MembershipEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use plexrpc_protocol::{InvocationDescriptor, NodeAddress, NodeCapabilitySnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Exchange state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    AwaitingSnapshot,
    Known,
}

/// Most recent snapshot received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub snapshot: NodeCapabilitySnapshot,
    pub received_at: DateTime<Utc>,
    /// Local receipt order across all peers.
    pub sequence: u64,
}

/// Immutable view of the peer table.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    entries: Arc<HashMap<NodeAddress, PeerEntry>>,
}

impl PeerTable {
    pub fn get(&self, peer: &NodeAddress) -> Option<&PeerEntry> {
        self.entries.get(peer)
    }

    pub fn contains(&self, peer: &NodeAddress) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddress, &PeerEntry)> {
        self.entries.iter()
    }

    /// Peers whose snapshot lists `service`, sorted by address.
    pub fn peers_serving(&self, service: &str) -> Vec<NodeAddress> {
        let mut peers: Vec<NodeAddress> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.snapshot.serves(service))
            .map(|(addr, _)| addr.clone())
            .collect();
        peers.sort();
        peers
    }
}

/// Exchange tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Re-request interval for peers without a snapshot. Zero disables.
    #[serde(default, with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Also re-request peers that already answered.
    #[serde(default)]
    pub refresh_known: bool,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// An invocation received over the group transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundInvocation {
    pub from: Option<NodeAddress>,
    pub invocation: InvocationDescriptor,
}

/// Runs the capability exchange for one node.
pub struct ClusterExchange {
    transport: Arc<dyn GroupTransport>,
    snapshot: NodeCapabilitySnapshot,
    config: ExchangeConfig,
    /// Current members and their exchange state.
    members: Mutex<HashMap<NodeAddress, PeerState>>,
    table: RwLock<PeerTable>,
    sequence: AtomicU64,
}

impl ClusterExchange {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        snapshot: NodeCapabilitySnapshot,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            transport,
            snapshot,
            config,
            members: Mutex::new(HashMap::new()),
            table: RwLock::new(PeerTable::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn local_address(&self) -> &NodeAddress {
        self.transport.local_address()
    }

    pub fn snapshot(&self) -> &NodeCapabilitySnapshot {
        &self.snapshot
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Returns the current peer table.
    pub fn peer_table(&self) -> PeerTable {
        self.table.read().clone()
    }

    pub fn peer_state(&self, peer: &NodeAddress) -> PeerState {
        self.members
            .lock()
            .get(peer)
            .copied()
            .unwrap_or(PeerState::Unknown)
    }

    /// Pushes this node's snapshot to every current member.
    ///
    /// Members that join later receive it when their join is observed.
    pub fn announce(&self) -> Result<(), ClusterError> {
        let frame =
            ClusterMessage::OnNodeConfiguration(self.snapshot.clone()).encode(self.local_address())?;
        tracing::info!(
            "Announcing {} external services to {} members",
            self.snapshot.external_services().len(),
            self.transport.members().len()
        );
        self.transport.broadcast(frame)
    }

    /// Sends a one-way invocation to every other member.
    pub fn broadcast_invocation(
        &self,
        invocation: InvocationDescriptor,
    ) -> Result<(), ClusterError> {
        let frame = ClusterMessage::Invocation(invocation).encode(self.local_address())?;
        self.transport.broadcast(frame)
    }

    /// Applies one group event.
    ///
    /// Returns invocations addressed to this node for the caller to dispatch.
    pub fn handle_event(
        &self,
        event: GroupEvent,
    ) -> Result<Option<InboundInvocation>, ClusterError> {
        match event {
            GroupEvent::Membership(MembershipEvent::Joined(peer)) => {
                self.peer_joined(peer);
                Ok(None)
            }
            GroupEvent::Membership(MembershipEvent::Departed(peer)) => {
                self.peer_departed(&peer);
                Ok(None)
            }
            GroupEvent::Message(frame) => {
                let envelope = ClusterMessage::decode(&frame)?;
                Ok(self.handle_message(envelope))
            }
        }
    }

    /// Re-requests snapshots according to the refresh settings.
    pub fn refresh(&self) {
        let targets: Vec<NodeAddress> = self
            .members
            .lock()
            .iter()
            .filter(|(_, state)| match state {
                PeerState::AwaitingSnapshot => true,
                PeerState::Known => self.config.refresh_known,
                PeerState::Unknown => false,
            })
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in targets {
            tracing::debug!("Re-requesting node configuration from {}", peer);
            self.request_snapshot(&peer);
        }
    }

    fn peer_joined(&self, peer: NodeAddress) {
        if &peer == self.local_address() {
            return;
        }
        tracing::info!("Peer {} joined; exchanging node configuration", peer);
        self.members
            .lock()
            .insert(peer.clone(), PeerState::AwaitingSnapshot);
        self.request_snapshot(&peer);
        // Members discovered after startup missed the initial announce
        self.send_snapshot(&peer);
    }

    fn peer_departed(&self, peer: &NodeAddress) {
        let was_member = self.members.lock().remove(peer).is_some();

        let mut table = self.table.write();
        if table.contains(peer) {
            let mut entries = (*table.entries).clone();
            entries.remove(peer);
            *table = PeerTable {
                entries: Arc::new(entries),
            };
        }
        drop(table);

        if was_member {
            tracing::info!("Peer {} departed", peer);
        }
    }

    fn handle_message(&self, envelope: Envelope) -> Option<InboundInvocation> {
        match envelope.message {
            ClusterMessage::GetNodeConfiguration => {
                match envelope.origin {
                    Some(origin) => self.send_snapshot(&origin),
                    None => tracing::warn!("Node configuration request without origin dropped"),
                }
                None
            }
            ClusterMessage::OnNodeConfiguration(snapshot) => {
                let peer = envelope
                    .origin
                    .unwrap_or_else(|| snapshot.node_address().clone());
                self.store_snapshot(peer, snapshot);
                None
            }
            ClusterMessage::Invocation(invocation) => Some(InboundInvocation {
                from: envelope.origin,
                invocation,
            }),
        }
    }

    fn store_snapshot(&self, peer: NodeAddress, snapshot: NodeCapabilitySnapshot) {
        if &peer == self.local_address() {
            return;
        }

        // Membership lock is held across the table swap so a concurrent
        // departure cannot interleave between the check and the insert.
        let mut members = self.members.lock();
        match members.get_mut(&peer) {
            Some(state) => *state = PeerState::Known,
            None => {
                tracing::debug!("Discarding node configuration from non-member {}", peer);
                return;
            }
        }

        let entry = PeerEntry {
            snapshot,
            received_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        };
        tracing::debug!(
            "Node configuration from {}: {:?}",
            peer,
            entry.snapshot.external_services()
        );

        let mut table = self.table.write();
        let mut entries = (*table.entries).clone();
        entries.insert(peer, entry);
        *table = PeerTable {
            entries: Arc::new(entries),
        };
        drop(table);
        drop(members);
    }

    fn request_snapshot(&self, peer: &NodeAddress) {
        let sent = ClusterMessage::GetNodeConfiguration
            .encode(self.local_address())
            .and_then(|frame| self.transport.send(peer, frame));
        if let Err(e) = sent {
            tracing::warn!("Failed to request node configuration from {}: {}", peer, e);
        }
    }

    fn send_snapshot(&self, peer: &NodeAddress) {
        let sent = ClusterMessage::OnNodeConfiguration(self.snapshot.clone())
            .encode(self.local_address())
            .and_then(|frame| self.transport.send(peer, frame));
        if let Err(e) = sent {
            tracing::warn!("Failed to send node configuration to {}: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalGroup;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc;

    fn snapshot(addr: &str, services: &[&str]) -> NodeCapabilitySnapshot {
        NodeCapabilitySnapshot::new(
            plexrpc_protocol::version_tag(),
            NodeAddress::from(addr),
            services.iter().map(|s| s.to_string()),
        )
    }

    fn drain(exchange: &ClusterExchange, rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> usize {
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            exchange.handle_event(event).unwrap();
            handled += 1;
        }
        handled
    }

    /// Transport that records frames instead of delivering them.
    struct RecordingTransport {
        address: NodeAddress,
        sent: Mutex<Vec<(NodeAddress, Bytes)>>,
    }

    impl RecordingTransport {
        fn new(address: &str) -> Arc<Self> {
            Arc::new(Self {
                address: NodeAddress::from(address),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take_sent(&self) -> Vec<(NodeAddress, ClusterMessage)> {
            self.sent
                .lock()
                .drain(..)
                .map(|(to, frame)| (to, ClusterMessage::decode(&frame).unwrap().message))
                .collect()
        }
    }

    impl GroupTransport for RecordingTransport {
        fn local_address(&self) -> &NodeAddress {
            &self.address
        }

        fn members(&self) -> Vec<NodeAddress> {
            Vec::new()
        }

        fn send(&self, to: &NodeAddress, frame: Bytes) -> Result<(), ClusterError> {
            self.sent.lock().push((to.clone(), frame));
            Ok(())
        }
    }

    fn joined(peer: &str) -> GroupEvent {
        GroupEvent::Membership(MembershipEvent::Joined(NodeAddress::from(peer)))
    }

    fn departed(peer: &str) -> GroupEvent {
        GroupEvent::Membership(MembershipEvent::Departed(NodeAddress::from(peer)))
    }

    fn response(peer: &str, services: &[&str]) -> GroupEvent {
        let frame = ClusterMessage::OnNodeConfiguration(snapshot(peer, services))
            .encode(&NodeAddress::from(peer))
            .unwrap();
        GroupEvent::Message(frame)
    }

    #[tokio::test]
    async fn test_two_node_exchange_and_departure() {
        let group = LocalGroup::new();
        let (a, mut a_rx) = group.join(NodeAddress::from("a"));
        let a = ClusterExchange::new(Arc::new(a), snapshot("a", &[]), ExchangeConfig::default());

        let (b_member, mut b_rx) = group.join(NodeAddress::from("b"));
        let b = ClusterExchange::new(
            Arc::new(b_member.clone()),
            snapshot("b", &["Echo"]),
            ExchangeConfig::default(),
        );

        // A sees the join and asks B
        drain(&a, &mut a_rx);
        assert_eq!(a.peer_state(&NodeAddress::from("b")), PeerState::AwaitingSnapshot);
        assert!(a.peer_table().is_empty());

        // B answers
        drain(&b, &mut b_rx);
        drain(&a, &mut a_rx);

        let table = a.peer_table();
        let entry = table.get(&NodeAddress::from("b")).unwrap();
        assert_eq!(
            entry.snapshot.external_services(),
            &BTreeSet::from(["Echo".to_string()])
        );
        assert_eq!(a.peer_state(&NodeAddress::from("b")), PeerState::Known);
        assert_eq!(table.peers_serving("Echo"), vec![NodeAddress::from("b")]);

        b_member.leave();
        drain(&a, &mut a_rx);
        assert!(!a.peer_table().contains(&NodeAddress::from("b")));
        assert_eq!(a.peer_state(&NodeAddress::from("b")), PeerState::Unknown);

        // The view taken before departure is unaffected
        assert!(table.contains(&NodeAddress::from("b")));
    }

    #[test]
    fn test_join_requests_and_pushes_snapshot() {
        let transport = RecordingTransport::new("a");
        let exchange = ClusterExchange::new(
            transport.clone(),
            snapshot("a", &["Orders"]),
            ExchangeConfig::default(),
        );

        // Nobody to announce to yet
        exchange.announce().unwrap();
        assert!(transport.take_sent().is_empty());

        exchange.handle_event(joined("b")).unwrap();
        assert_eq!(
            transport.take_sent(),
            vec![
                (NodeAddress::from("b"), ClusterMessage::GetNodeConfiguration),
                (
                    NodeAddress::from("b"),
                    ClusterMessage::OnNodeConfiguration(snapshot("a", &["Orders"]))
                ),
            ]
        );
    }

    #[test]
    fn test_request_answered_unconditionally() {
        let transport = RecordingTransport::new("a");
        let exchange = ClusterExchange::new(
            transport.clone(),
            snapshot("a", &["Orders"]),
            ExchangeConfig::default(),
        );

        // "z" never joined, but still gets an answer
        let frame = ClusterMessage::GetNodeConfiguration
            .encode(&NodeAddress::from("z"))
            .unwrap();
        exchange.handle_event(GroupEvent::Message(frame)).unwrap();

        let sent = transport.take_sent();
        assert_eq!(
            sent,
            vec![(
                NodeAddress::from("z"),
                ClusterMessage::OnNodeConfiguration(snapshot("a", &["Orders"]))
            )]
        );
    }

    #[test]
    fn test_stale_response_after_departure_discarded() {
        let exchange = ClusterExchange::new(
            RecordingTransport::new("a"),
            snapshot("a", &[]),
            ExchangeConfig::default(),
        );

        exchange.handle_event(joined("b")).unwrap();
        exchange.handle_event(departed("b")).unwrap();
        exchange.handle_event(response("b", &["Echo"])).unwrap();

        assert!(exchange.peer_table().is_empty());
        assert_eq!(exchange.peer_state(&NodeAddress::from("b")), PeerState::Unknown);
    }

    #[test]
    fn test_later_snapshot_replaces_earlier() {
        let exchange = ClusterExchange::new(
            RecordingTransport::new("a"),
            snapshot("a", &[]),
            ExchangeConfig::default(),
        );

        exchange.handle_event(joined("b")).unwrap();
        exchange.handle_event(response("b", &["Echo", "Orders"])).unwrap();
        let first = exchange.peer_table().get(&NodeAddress::from("b")).unwrap().sequence;

        exchange.handle_event(response("b", &["Billing"])).unwrap();
        let table = exchange.peer_table();
        let entry = table.get(&NodeAddress::from("b")).unwrap();
        assert!(entry.sequence > first);
        assert_eq!(
            entry.snapshot.external_services(),
            &BTreeSet::from(["Billing".to_string()])
        );
        assert!(table.peers_serving("Echo").is_empty());
    }

    #[test]
    fn test_refresh_targets() {
        let transport = RecordingTransport::new("a");
        let exchange = ClusterExchange::new(
            transport.clone(),
            snapshot("a", &[]),
            ExchangeConfig {
                refresh_interval: Duration::from_secs(5),
                refresh_known: false,
            },
        );

        exchange.handle_event(joined("b")).unwrap();
        exchange.handle_event(joined("c")).unwrap();
        exchange.handle_event(response("c", &["Echo"])).unwrap();
        transport.take_sent();

        exchange.refresh();
        let sent = transport.take_sent();
        assert_eq!(
            sent,
            vec![(NodeAddress::from("b"), ClusterMessage::GetNodeConfiguration)]
        );
    }

    #[test]
    fn test_invocation_returned_to_caller() {
        let exchange = ClusterExchange::new(
            RecordingTransport::new("a"),
            snapshot("a", &[]),
            ExchangeConfig::default(),
        );
        let invocation = InvocationDescriptor::new("Echo", "ping", vec![]);
        let frame = ClusterMessage::Invocation(invocation.clone())
            .encode(&NodeAddress::from("b"))
            .unwrap();

        let inbound = exchange
            .handle_event(GroupEvent::Message(frame))
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from, Some(NodeAddress::from("b")));
        assert_eq!(inbound.invocation, invocation);
    }

    #[tokio::test]
    async fn test_announce_reaches_members() {
        let group = LocalGroup::new();
        let (a_member, mut a_rx) = group.join(NodeAddress::from("a"));
        let (b_member, mut b_rx) = group.join(NodeAddress::from("b"));

        let a = ClusterExchange::new(Arc::new(a_member), snapshot("a", &[]), ExchangeConfig::default());
        let b = ClusterExchange::new(
            Arc::new(b_member),
            snapshot("b", &["Echo"]),
            ExchangeConfig::default(),
        );

        b.announce().unwrap();
        // Join event precedes the push in A's queue
        drain(&a, &mut a_rx);
        assert_eq!(
            a.peer_table().peers_serving("Echo"),
            vec![NodeAddress::from("b")]
        );
        drain(&b, &mut b_rx);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Join(usize),
        Depart(usize),
        Respond(usize, Vec<usize>),
    }

    const PEERS: [&str; 3] = ["p0", "p1", "p2"];
    const SERVICES: [&str; 3] = ["Echo", "Orders", "Billing"];

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..PEERS.len()).prop_map(Step::Join),
            (0..PEERS.len()).prop_map(Step::Depart),
            (0..PEERS.len(), proptest::collection::vec(0..SERVICES.len(), 0..3))
                .prop_map(|(p, s)| Step::Respond(p, s)),
        ]
    }

    proptest! {
        #[test]
        fn prop_table_holds_latest_snapshot_of_members(steps in proptest::collection::vec(step(), 0..40)) {
            let exchange = ClusterExchange::new(
                RecordingTransport::new("self"),
                snapshot("self", &[]),
                ExchangeConfig::default(),
            );
            let mut members: BTreeSet<usize> = BTreeSet::new();
            let mut model: HashMap<usize, BTreeSet<String>> = HashMap::new();

            for step in steps {
                match step {
                    Step::Join(p) => {
                        exchange.handle_event(joined(PEERS[p])).unwrap();
                        members.insert(p);
                    }
                    Step::Depart(p) => {
                        exchange.handle_event(departed(PEERS[p])).unwrap();
                        members.remove(&p);
                        model.remove(&p);
                    }
                    Step::Respond(p, services) => {
                        let names: Vec<&str> = services.iter().map(|i| SERVICES[*i]).collect();
                        exchange.handle_event(response(PEERS[p], &names)).unwrap();
                        if members.contains(&p) {
                            model.insert(p, names.iter().map(|s| s.to_string()).collect());
                        }
                    }
                }

                let table = exchange.peer_table();
                prop_assert_eq!(table.len(), model.len());
                for (p, services) in &model {
                    let entry = table.get(&NodeAddress::from(PEERS[*p]));
                    prop_assert!(entry.is_some());
                    prop_assert_eq!(entry.unwrap().snapshot.external_services(), services);
                }
            }
        }
    }
}
