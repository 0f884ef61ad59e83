//! Cluster wiring: the exchange event loop and seed-list membership.
//!
//! [`SeedGroup`] is a [`GroupTransport`] whose members are the configured
//! seeds that currently answer a ping. Cluster messages to a member travel
//! as socket operations over a per-peer link:
//!
//! - `GetNodeConfiguration` becomes GET_NODE_CONFIGURATION; the reply is fed
//!   back into the local event stream as that peer's `OnNodeConfiguration`
//! - `OnNodeConfiguration` becomes ON_NODE_CONFIGURATION
//! - `Invocation` becomes NOTIFY on a session marked as a cluster link

use crate::dispatcher::{CallSource, Dispatcher};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::CLUSTER_LINK_ATTRIBUTE;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use plexrpc_client::{Client, ConnectionConfig};
use plexrpc_cluster::{
    ClusterError, ClusterExchange, ClusterMessage, GroupEvent, GroupTransport, InboundInvocation,
    MembershipEvent,
};
use plexrpc_core::TransportKind;
use plexrpc_protocol::NodeAddress;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Drives a [`ClusterExchange`] from a group event stream.
pub struct ClusterListener {
    exchange: Arc<ClusterExchange>,
    dispatcher: Arc<Dispatcher>,
    metrics: Option<Arc<Metrics>>,
}

impl ClusterListener {
    pub fn new(exchange: Arc<ClusterExchange>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            exchange,
            dispatcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn exchange(&self) -> &Arc<ClusterExchange> {
        &self.exchange
    }

    /// Announces this node, then applies events until the stream ends or
    /// shutdown is signalled.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<GroupEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if let Err(e) = self.exchange.announce() {
            tracing::warn!("Initial announce failed: {}", e);
        }

        let refresh_interval = self.exchange.config().refresh_interval;
        let mut refresh = (!refresh_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Group event stream closed");
                        break;
                    };
                    match self.exchange.handle_event(event) {
                        Ok(Some(inbound)) => self.dispatch(inbound),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Discarding cluster event: {}", e),
                    }
                    if let Some(ref metrics) = self.metrics {
                        metrics.cluster_peers.set(self.exchange.peer_table().len() as f64);
                    }
                }
                _ = async {
                    match refresh.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.exchange.refresh();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Cluster listener shutting down");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, inbound: InboundInvocation) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let source = CallSource::new(inbound.from);
            // Failures are logged by the dispatcher
            let _ = dispatcher
                .call(TransportKind::Cluster, inbound.invocation, source)
                .await;
        });
    }
}

/// Link settings shared by every peer connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub client_name: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            client_name: "plexrpc-cluster".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Group membership over a static seed list.
pub struct SeedGroup {
    local: NodeAddress,
    seeds: Vec<NodeAddress>,
    link: LinkConfig,
    members: RwLock<BTreeSet<NodeAddress>>,
    events: mpsc::UnboundedSender<GroupEvent>,
    links: DashMap<NodeAddress, mpsc::UnboundedSender<ClusterMessage>>,
}

impl SeedGroup {
    /// Creates the group and the event stream the exchange consumes.
    pub fn new(
        local: NodeAddress,
        seeds: Vec<NodeAddress>,
        link: LinkConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GroupEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let seeds = seeds.into_iter().filter(|s| *s != local).collect();
        let group = Arc::new(Self {
            local,
            seeds,
            link,
            members: RwLock::new(BTreeSet::new()),
            events,
            links: DashMap::new(),
        });
        (group, rx)
    }

    /// Sender feeding the local event stream. Socket pushes of peer
    /// snapshots are injected here.
    pub fn inbox(&self) -> mpsc::UnboundedSender<GroupEvent> {
        self.events.clone()
    }

    pub fn seeds(&self) -> &[NodeAddress] {
        &self.seeds
    }

    /// Pings every seed each `interval` and reports membership changes until
    /// shutdown.
    pub async fn monitor(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.recv() => {
                    tracing::debug!("Seed monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn probe_all(&self) {
        for seed in &self.seeds {
            let reachable = match self.probe(seed).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Seed {} unreachable: {}", seed, e);
                    false
                }
            };
            let is_member = self.members.read().contains(seed);

            if reachable && !is_member {
                self.members.write().insert(seed.clone());
                let _ = self
                    .events
                    .send(GroupEvent::Membership(MembershipEvent::Joined(seed.clone())));
            } else if !reachable && is_member {
                self.members.write().remove(seed);
                self.links.remove(seed);
                let _ = self
                    .events
                    .send(GroupEvent::Membership(MembershipEvent::Departed(seed.clone())));
            }
        }
    }

    async fn probe(&self, seed: &NodeAddress) -> Result<(), ServerError> {
        let client = Client::new(self.connection_config(resolve(seed)?));
        client.connect().await?;
        let result = client.ping().await;
        let _ = client.close().await;
        Ok(result?)
    }

    fn connection_config(&self, addr: SocketAddr) -> ConnectionConfig {
        ConnectionConfig::new(addr)
            .with_client_name(self.link.client_name.clone())
            .with_connect_timeout(self.link.connect_timeout)
            .with_request_timeout(self.link.request_timeout)
            .with_origin(self.local.clone())
            .with_attribute(CLUSTER_LINK_ATTRIBUTE, "true")
    }

    fn link_for(&self, peer: &NodeAddress) -> Result<mpsc::UnboundedSender<ClusterMessage>, ClusterError> {
        if let Some(tx) = self.links.get(peer) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let addr = resolve(peer).map_err(|_| ClusterError::UnknownMember(peer.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(
            peer.clone(),
            self.connection_config(addr),
            rx,
            self.events.clone(),
        ));
        self.links.insert(peer.clone(), tx.clone());
        Ok(tx)
    }
}

impl GroupTransport for SeedGroup {
    fn local_address(&self) -> &NodeAddress {
        &self.local
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.members.read().iter().cloned().collect()
    }

    fn send(&self, to: &NodeAddress, frame: Bytes) -> Result<(), ClusterError> {
        if !self.members.read().contains(to) {
            return Err(ClusterError::UnknownMember(to.clone()));
        }
        let envelope = ClusterMessage::decode(&frame)?;
        self.link_for(to)?
            .send(envelope.message)
            .map_err(|_| ClusterError::Closed)
    }
}

fn resolve(peer: &NodeAddress) -> Result<SocketAddr, ServerError> {
    peer.socket_addr()
        .ok_or_else(|| ServerError::InvalidRequest(format!("not a socket address: {}", peer)))
}

/// Delivers messages to one peer in order, reconnecting as needed.
async fn run_link(
    peer: NodeAddress,
    config: ConnectionConfig,
    mut rx: mpsc::UnboundedReceiver<ClusterMessage>,
    events: mpsc::UnboundedSender<GroupEvent>,
) {
    let mut client: Option<Client> = None;

    while let Some(message) = rx.recv().await {
        if client.as_ref().map_or(true, |c| !c.is_connected()) {
            let fresh = Client::new(config.clone());
            if let Err(e) = fresh.connect().await {
                tracing::warn!("Dropping cluster message for {}: {}", peer, e);
                continue;
            }
            client = Some(fresh);
        }
        let Some(link) = client.as_ref() else {
            continue;
        };

        if let Err(e) = deliver(link, &peer, message, &events).await {
            tracing::warn!("Cluster message to {} failed: {}", peer, e);
        }
    }
    tracing::debug!("Link to {} closed", peer);
}

async fn deliver(
    client: &Client,
    peer: &NodeAddress,
    message: ClusterMessage,
    events: &mpsc::UnboundedSender<GroupEvent>,
) -> Result<(), ServerError> {
    match message {
        ClusterMessage::GetNodeConfiguration => {
            let snapshot = client.node_configuration().await?;
            let frame = ClusterMessage::OnNodeConfiguration(snapshot).encode(peer)?;
            events
                .send(GroupEvent::Message(frame))
                .map_err(|_| ServerError::ShuttingDown)
        }
        ClusterMessage::OnNodeConfiguration(snapshot) => {
            Ok(client.push_node_configuration(&snapshot).await?)
        }
        ClusterMessage::Invocation(invocation) => Ok(client.notify(invocation).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_cluster::{ExchangeConfig, LocalGroup};
    use plexrpc_core::{FnController, RegistryBuilder};
    use plexrpc_protocol::InvocationDescriptor;
    use serde_json::{json, Value};

    fn dispatcher(
        address: &str,
        tx: mpsc::UnboundedSender<(Value, Option<NodeAddress>)>,
    ) -> Arc<Dispatcher> {
        let mut builder = RegistryBuilder::new(NodeAddress::from(address));
        builder
            .register(
                "Cache",
                "evict",
                [TransportKind::Cluster],
                FnController::new(1, move |ctx, args| {
                    let _ = tx.send((args[0].clone(), ctx.peer().cloned()));
                    Ok(Value::Null)
                }),
            )
            .unwrap();
        builder
            .register(
                "Orders",
                "get",
                [TransportKind::Http],
                crate::builtin::ping(),
            )
            .unwrap();
        Arc::new(Dispatcher::new(Arc::new(builder.build())))
    }

    #[tokio::test]
    async fn test_listener_exchanges_snapshots_and_runs_invocations() {
        let group = LocalGroup::new();
        let (calls_tx, mut calls_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let mut exchanges = Vec::new();
        for address in ["node-a", "node-b"] {
            let dispatcher = dispatcher(address, calls_tx.clone());
            let (member, events) = group.join(NodeAddress::from(address));
            let exchange = Arc::new(ClusterExchange::new(
                Arc::new(member),
                dispatcher.snapshot(),
                ExchangeConfig::default(),
            ));
            let metrics = Arc::new(Metrics::new().unwrap());
            let listener = ClusterListener::new(exchange.clone(), dispatcher).with_metrics(metrics);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { listener.run(events, rx).await });
            exchanges.push(exchange);
        }

        let a = &exchanges[0];
        for _ in 0..100 {
            if a.peer_table().len() == 1 && exchanges[1].peer_table().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let table = a.peer_table();
        assert_eq!(table.peers_serving("Orders"), vec![NodeAddress::from("node-b")]);

        a.broadcast_invocation(InvocationDescriptor::new("Cache", "evict", vec![json!("k1")]))
            .unwrap();
        let (value, from) = tokio::time::timeout(Duration::from_secs(2), calls_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("k1"));
        assert_eq!(from, Some(NodeAddress::from("node-a")));

        shutdown.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_seed_group_rejects_non_members() {
        let local = NodeAddress::from("127.0.0.1:7411");
        let (group, _events) = SeedGroup::new(
            local.clone(),
            vec![local.clone(), NodeAddress::from("127.0.0.1:7412")],
            LinkConfig::default(),
        );
        // The local address is never its own seed
        assert_eq!(group.seeds(), &[NodeAddress::from("127.0.0.1:7412")]);
        assert!(group.members().is_empty());

        let frame = ClusterMessage::GetNodeConfiguration.encode(&local).unwrap();
        let err = group
            .send(&NodeAddress::from("127.0.0.1:7412"), frame)
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnknownMember(_)));
    }

    #[tokio::test]
    async fn test_unreachable_seed_never_joins() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let link = LinkConfig {
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (group, mut events) =
            SeedGroup::new(NodeAddress::from("127.0.0.1:1"), vec![NodeAddress::from(addr)], link);

        group.probe_all().await;
        assert!(group.members().is_empty());
        assert!(events.try_recv().is_err());
    }
}
