//! Dispatch strategies for proxied calls.
//!
//! - [`BlockingDispatch`] performs a round trip over the socket transport.
//! - [`OneWayDispatch`] publishes onto a message queue.
//! - [`BroadcastDispatch`] sends to every cluster member.
//!
//! One-way strategies return [`DispatchOutcome::Acknowledged`] as soon as the
//! invocation is encoded and enqueued.

use crate::client::Client;
use crate::connection::ConnectionConfig;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use plexrpc_cluster::{ClusterExchange, ClusterMessage, GroupTransport, PeerTable};
use plexrpc_core::{QueueTransport, RpcError};
use plexrpc_protocol::{Encoder, InvocationDescriptor, NodeAddress, Operation};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How a strategy delivers calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Blocking,
    OneWay,
    Broadcast,
}

impl DispatchMode {
    /// Whether the caller never sees the handler's result.
    pub fn is_one_way(&self) -> bool {
        !matches!(self, DispatchMode::Blocking)
    }
}

/// Result of handing an invocation to a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Round trip completed with the handler's result.
    Delivered(Value),
    /// Accepted for one-way delivery; no result will follow.
    Acknowledged,
    Failed(RpcError),
}

/// A dispatch strategy.
#[async_trait]
pub trait InvocationCallback: Send + Sync {
    fn mode(&self) -> DispatchMode;

    async fn dispatch(&self, invocation: InvocationDescriptor) -> DispatchOutcome;
}

// ============================================================================
// Blocking
// ============================================================================

/// Picks the peer that should serve a service.
pub trait PeerResolver: Send + Sync {
    fn candidates(&self, service: &str) -> Vec<NodeAddress>;
}

impl PeerResolver for PeerTable {
    fn candidates(&self, service: &str) -> Vec<NodeAddress> {
        self.peers_serving(service)
    }
}

impl PeerResolver for ClusterExchange {
    fn candidates(&self, service: &str) -> Vec<NodeAddress> {
        self.peer_table().peers_serving(service)
    }
}

/// Where blocking calls go.
#[derive(Clone)]
pub enum Target {
    /// Always the same node.
    Fixed(SocketAddr),
    /// A node whose snapshot lists the service, rotating between candidates.
    Routed(Arc<dyn PeerResolver>),
}

/// Synchronous round trip over the socket transport.
pub struct BlockingDispatch {
    target: Target,
    template: ConnectionConfig,
    pool: DashMap<SocketAddr, Arc<Client>>,
    next: AtomicUsize,
}

impl BlockingDispatch {
    /// `template` supplies timeouts and identity; its address is replaced per
    /// target.
    pub fn new(target: Target, template: ConnectionConfig) -> Self {
        Self {
            target,
            template,
            pool: DashMap::new(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn fixed(addr: SocketAddr) -> Self {
        Self::new(Target::Fixed(addr), ConnectionConfig::new(addr))
    }

    pub fn request_timeout(&self) -> Duration {
        self.template.request_timeout
    }

    fn pick(&self, invocation: &InvocationDescriptor) -> Result<SocketAddr, RpcError> {
        match &self.target {
            Target::Fixed(addr) => Ok(*addr),
            Target::Routed(resolver) => {
                let candidates = resolver.candidates(&invocation.service);
                if candidates.is_empty() {
                    return Err(RpcError::unreachable(
                        &invocation.service,
                        "no peer serves service",
                    ));
                }
                let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
                let peer = &candidates[i];
                peer.socket_addr()
                    .ok_or_else(|| RpcError::unreachable(peer, "not a socket address"))
            }
        }
    }

    async fn client_for(&self, addr: SocketAddr) -> Result<Arc<Client>, RpcError> {
        if let Some(client) = self.pool.get(&addr) {
            if client.is_connected() {
                return Ok(client.clone());
            }
        }

        let mut config = self.template.clone();
        config.addr = addr;
        let client = Arc::new(Client::new(config));
        client
            .connect()
            .await
            .map_err(|e| e.into_rpc_error(addr))?;

        self.pool.insert(addr, client.clone());
        Ok(client)
    }

    async fn round_trip(&self, invocation: InvocationDescriptor) -> Result<Value, RpcError> {
        let addr = self.pick(&invocation)?;
        let client = self.client_for(addr).await?;

        match tokio::time::timeout(
            self.template.request_timeout,
            client.invoke_descriptor(invocation),
        )
        .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if !client.is_connected() {
                    self.pool.remove(&addr);
                }
                Err(e.into_rpc_error(addr))
            }
            Err(_) => {
                self.pool.remove(&addr);
                Err(RpcError::unreachable(addr, "request timed out"))
            }
        }
    }
}

#[async_trait]
impl InvocationCallback for BlockingDispatch {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Blocking
    }

    async fn dispatch(&self, invocation: InvocationDescriptor) -> DispatchOutcome {
        match self.round_trip(invocation).await {
            Ok(value) => DispatchOutcome::Delivered(value),
            Err(e) => DispatchOutcome::Failed(e),
        }
    }
}

// ============================================================================
// One-way queue publish
// ============================================================================

/// Maps an invocation to a queue name.
pub trait QueueRouter: Send + Sync {
    fn route(&self, invocation: &InvocationDescriptor) -> String;
}

impl<F> QueueRouter for F
where
    F: Fn(&InvocationDescriptor) -> String + Send + Sync,
{
    fn route(&self, invocation: &InvocationDescriptor) -> String {
        self(invocation)
    }
}

/// Routes every service to `<prefix><service>`.
#[derive(Debug, Clone)]
pub struct ServiceQueueRouter {
    prefix: String,
}

impl ServiceQueueRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for ServiceQueueRouter {
    fn default() -> Self {
        Self::new("rpc.")
    }
}

impl QueueRouter for ServiceQueueRouter {
    fn route(&self, invocation: &InvocationDescriptor) -> String {
        format!("{}{}", self.prefix, invocation.service)
    }
}

/// Publishes invocations onto a message queue.
///
/// Each destination queue has its own unbounded channel drained by one
/// sender task, so calls to one queue keep their order while queues do not
/// wait on each other.
pub struct OneWayDispatch {
    queue: Arc<dyn QueueTransport>,
    router: Arc<dyn QueueRouter>,
    origin: Option<NodeAddress>,
    senders: DashMap<String, mpsc::UnboundedSender<Bytes>>,
}

impl OneWayDispatch {
    pub fn new(queue: Arc<dyn QueueTransport>, router: Arc<dyn QueueRouter>) -> Self {
        Self {
            queue,
            router,
            origin: None,
            senders: DashMap::new(),
        }
    }

    pub fn with_origin(mut self, origin: NodeAddress) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Number of destinations with a running sender task.
    pub fn destinations(&self) -> usize {
        self.senders.len()
    }

    fn encode(&self, invocation: InvocationDescriptor) -> Result<Bytes, RpcError> {
        let mut request = invocation
            .into_request(Operation::Notify)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if let Some(origin) = &self.origin {
            request = request.with_origin(origin.clone());
        }
        Encoder::encode_request(&request)
            .map(|frame| frame.freeze())
            .map_err(|e| RpcError::internal(e.to_string()))
    }

    fn sender_for(&self, queue: &str) -> mpsc::UnboundedSender<Bytes> {
        if let Some(tx) = self.senders.get(queue) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        // The entry guard is held across the spawn so one queue never gets two
        // sender tasks.
        match self.senders.entry(queue.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(self.spawn_sender(queue));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(self.spawn_sender(queue)).value().clone(),
        }
    }

    fn spawn_sender(&self, queue: &str) -> mpsc::UnboundedSender<Bytes> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let transport = self.queue.clone();
        let name = queue.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = transport.publish(&name, frame) {
                    tracing::warn!("Dropping one-way call for {}: {}", name, e);
                }
            }
        });
        tx
    }
}

#[async_trait]
impl InvocationCallback for OneWayDispatch {
    fn mode(&self) -> DispatchMode {
        DispatchMode::OneWay
    }

    async fn dispatch(&self, invocation: InvocationDescriptor) -> DispatchOutcome {
        let queue = self.router.route(&invocation);
        let frame = match self.encode(invocation) {
            Ok(frame) => frame,
            Err(e) => return DispatchOutcome::Failed(e),
        };

        match self.sender_for(&queue).send(frame) {
            Ok(()) => DispatchOutcome::Acknowledged,
            Err(_) => DispatchOutcome::Failed(RpcError::internal(format!(
                "sender for queue {} stopped",
                queue
            ))),
        }
    }
}

// ============================================================================
// Cluster broadcast
// ============================================================================

/// Sends invocations to every other cluster member.
pub struct BroadcastDispatch {
    group: Arc<dyn GroupTransport>,
}

impl BroadcastDispatch {
    pub fn new(group: Arc<dyn GroupTransport>) -> Self {
        Self { group }
    }
}

#[async_trait]
impl InvocationCallback for BroadcastDispatch {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Broadcast
    }

    async fn dispatch(&self, invocation: InvocationDescriptor) -> DispatchOutcome {
        let sent = ClusterMessage::Invocation(invocation)
            .encode(self.group.local_address())
            .and_then(|frame| self.group.broadcast(frame));
        match sent {
            Ok(()) => DispatchOutcome::Acknowledged,
            Err(e) => DispatchOutcome::Failed(RpcError::internal(e.to_string())),
        }
    }
}
