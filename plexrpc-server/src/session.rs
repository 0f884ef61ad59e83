//! Socket session state.

use plexrpc_protocol::NodeAddress;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Wire mode for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// Binary framing with JSON payload.
    #[default]
    BinaryJson,
    /// Line-delimited JSON (debug mode).
    Jsonl,
}

impl WireMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireMode::BinaryJson => "binary_json",
            WireMode::Jsonl => "jsonl",
        }
    }

    /// Picks the first mode the server supports from a client's list.
    pub fn negotiate(offered: &[String]) -> WireMode {
        if offered.iter().any(|m| m == "binary_json") {
            WireMode::BinaryJson
        } else if offered.iter().any(|m| m == "jsonl") {
            WireMode::Jsonl
        } else {
            WireMode::BinaryJson
        }
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for HELLO.
    Connected,
    /// Handshake complete, calls accepted.
    Ready,
    /// Session is closing.
    Closing,
}

/// HELLO attribute marking a connection opened by a cluster peer. Calls on
/// such a session are routed under the `cluster` transport kind.
pub const CLUSTER_LINK_ATTRIBUTE: &str = "plexrpc.cluster_link";

/// A socket client session.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,
    wire_mode: WireMode,
    protocol_version: u16,
    client_name: Option<String>,

    /// Connection-scoped attributes from HELLO, copied into every call.
    attributes: BTreeMap<String, String>,

    /// Node address stamped on HELLO by the connecting peer.
    origin: Option<NodeAddress>,

    request_count: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            wire_mode: WireMode::default(),
            protocol_version: 0,
            client_name: None,
            attributes: BTreeMap::new(),
            origin: None,
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn wire_mode(&self) -> WireMode {
        self.wire_mode
    }

    /// Forces the wire mode, e.g. when the first bytes are a JSON line.
    pub fn set_wire_mode(&mut self, wire_mode: WireMode) {
        self.wire_mode = wire_mode;
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn is_cluster_link(&self) -> bool {
        self.attributes
            .get(CLUSTER_LINK_ATTRIBUTE)
            .is_some_and(|v| v == "true")
    }

    pub fn set_origin(&mut self, origin: Option<NodeAddress>) {
        self.origin = origin;
    }

    /// The cluster identity of this connection. Only a handshaked cluster
    /// link that stamped its HELLO with an origin has one.
    pub fn link_origin(&self) -> Option<&NodeAddress> {
        if self.is_ready() && self.is_cluster_link() {
            self.origin.as_ref()
        } else {
            None
        }
    }

    /// Peer address used for calls that carry no origin.
    pub fn peer(&self) -> NodeAddress {
        NodeAddress::from(self.remote_addr)
    }

    /// Completes the handshake.
    pub fn complete_handshake(
        &mut self,
        protocol_version: u16,
        wire_mode: WireMode,
        client_name: Option<String>,
        attributes: BTreeMap<String, String>,
    ) {
        self.protocol_version = protocol_version;
        self.wire_mode = wire_mode;
        self.client_name = client_name;
        self.attributes = attributes;
        self.state = SessionState::Ready;
    }

    /// Records a request.
    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(test_addr());
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.is_ready());
        assert_eq!(session.peer().as_str(), "127.0.0.1:12345");
    }

    #[test]
    fn test_session_handshake() {
        let mut session = Session::new(test_addr());
        let attributes = BTreeMap::from([("tenant".to_string(), "acme".to_string())]);
        session.complete_handshake(
            1,
            WireMode::Jsonl,
            Some("test-client".to_string()),
            attributes,
        );

        assert!(session.is_ready());
        assert_eq!(session.protocol_version(), 1);
        assert_eq!(session.wire_mode(), WireMode::Jsonl);
        assert_eq!(session.client_name(), Some("test-client"));
        assert_eq!(session.attributes()["tenant"], "acme");
    }

    #[test]
    fn test_cluster_link_attribute() {
        let mut session = Session::new(test_addr());
        session.set_origin(Some(NodeAddress::from("10.0.0.2:7411")));
        assert!(!session.is_cluster_link());
        assert!(session.link_origin().is_none());
        session.complete_handshake(
            1,
            WireMode::BinaryJson,
            None,
            BTreeMap::from([(CLUSTER_LINK_ATTRIBUTE.to_string(), "true".to_string())]),
        );
        assert!(session.is_cluster_link());
        assert_eq!(
            session.link_origin(),
            Some(&NodeAddress::from("10.0.0.2:7411"))
        );
    }

    #[test]
    fn test_wire_mode_negotiation() {
        let offer = |modes: &[&str]| -> Vec<String> { modes.iter().map(|m| m.to_string()).collect() };
        assert_eq!(WireMode::negotiate(&offer(&["jsonl"])), WireMode::Jsonl);
        assert_eq!(
            WireMode::negotiate(&offer(&["jsonl", "binary_json"])),
            WireMode::BinaryJson
        );
        assert_eq!(WireMode::negotiate(&[]), WireMode::BinaryJson);
    }

    #[test]
    fn test_record_request() {
        let mut session = Session::new(test_addr());
        session.record_request();
        session.record_request();
        assert_eq!(session.request_count(), 2);
        assert!(session.idle_duration() <= session.age());
    }
}
