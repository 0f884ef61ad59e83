//! A running plexrpc node: every configured listener around one dispatcher.

use crate::cluster_link::{ClusterListener, LinkConfig, SeedGroup};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, ServerInfo};
use crate::error::ServerError;
use crate::http::HttpListener;
use crate::metrics::{run_metrics_server, Metrics};
use crate::queue::QueueListener;
use crate::server::{Server, ServerConfig};
use plexrpc_cluster::ClusterExchange;
use plexrpc_core::{CapabilityRegistry, ControllerCatalog, QueueBroker, RegistryBuilder};
use plexrpc_protocol::NodeAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Node;

impl Node {
    /// Binds every enabled listener, builds the registry from the configured
    /// bindings and starts serving.
    ///
    /// The node address defaults to the socket listener's bound address.
    pub async fn start(config: Config, catalog: ControllerCatalog) -> Result<NodeHandle, ServerError> {
        config.validate()?;

        let socket = TcpListener::bind(config.network.bind_addr).await?;
        let socket_addr = socket.local_addr()?;
        let http = match config.http.enabled {
            true => Some(TcpListener::bind(config.http.bind_addr).await?),
            false => None,
        };
        let metrics_listener = match config.metrics.enabled {
            true => Some(TcpListener::bind(config.metrics.bind_addr).await?),
            false => None,
        };

        let node_address = config
            .node
            .address
            .clone()
            .unwrap_or_else(|| NodeAddress::from(socket_addr));

        let mut builder = RegistryBuilder::new(node_address.clone());
        builder.register_from_config(&catalog, &config.controllers)?;
        let registry = Arc::new(builder.build());
        tracing::info!(
            "Node {} serves {} controllers ({} external services)",
            node_address,
            registry.len(),
            registry.snapshot().external_services().len()
        );

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        let mut dispatcher = Dispatcher::new(registry.clone())
            .with_info(ServerInfo {
                name: config.node.name.clone().unwrap_or_else(|| "plexrpc".to_string()),
                ..Default::default()
            })
            .with_masked_errors(config.errors.mask_handler_errors);

        let metrics = match metrics_listener {
            Some(listener) => {
                let metrics = Arc::new(Metrics::new()?);
                dispatcher = dispatcher.with_metrics(metrics.clone());
                tasks.push(tokio::spawn(run_metrics_server(
                    listener,
                    metrics.clone(),
                    shutdown.subscribe(),
                )));
                Some(metrics)
            }
            None => None,
        };

        let cluster = match config.cluster.enabled {
            true => {
                let link = LinkConfig {
                    client_name: format!("plexrpc-cluster/{}", node_address),
                    ..Default::default()
                };
                let (group, events) =
                    SeedGroup::new(node_address.clone(), config.cluster.seeds.clone(), link);
                dispatcher = dispatcher.with_cluster_inbox(group.inbox());
                let exchange = Arc::new(ClusterExchange::new(
                    group.clone(),
                    registry.snapshot(),
                    config.cluster.exchange.clone(),
                ));
                Some((group, events, exchange))
            }
            false => None,
        };

        let dispatcher = Arc::new(dispatcher);

        // Socket listener
        let mut server_config = ServerConfig::from(&config.network);
        if let Some(ref metrics) = metrics {
            server_config = server_config.with_metrics(metrics.clone());
        }
        let server = Arc::new(Server::new(server_config, dispatcher.clone()));
        {
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.serve(socket).await {
                    tracing::error!("Socket listener failed: {}", e);
                }
            }));
        }

        // HTTP listener
        let http_addr = match http {
            Some(listener) => {
                let addr = listener.local_addr()?;
                let http = HttpListener::new(dispatcher.clone());
                let rx = shutdown.subscribe();
                tasks.push(tokio::spawn(async move { http.serve(listener, rx).await }));
                Some(addr)
            }
            None => None,
        };

        // Queue listener
        let queue = Arc::new(QueueBroker::new());
        tasks.extend(
            QueueListener::new(queue.clone(), dispatcher.clone(), config.queue.prefix.clone())
                .start(&shutdown)?,
        );

        // Cluster
        let exchange = match cluster {
            Some((group, events, exchange)) => {
                let mut listener = ClusterListener::new(exchange.clone(), dispatcher.clone());
                if let Some(ref metrics) = metrics {
                    listener = listener.with_metrics(metrics.clone());
                }
                let rx = shutdown.subscribe();
                tasks.push(tokio::spawn(async move { listener.run(events, rx).await }));
                tasks.push(tokio::spawn(
                    group.monitor(config.cluster.probe_interval(), shutdown.subscribe()),
                ));
                Some(exchange)
            }
            None => None,
        };

        tracing::info!("Node {} started", node_address);
        Ok(NodeHandle {
            node_address,
            socket_addr,
            http_addr,
            registry,
            queue,
            exchange,
            server,
            shutdown,
            tasks,
        })
    }
}

/// Handle to a running node.
pub struct NodeHandle {
    node_address: NodeAddress,
    socket_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    registry: Arc<CapabilityRegistry>,
    queue: Arc<QueueBroker>,
    exchange: Option<Arc<ClusterExchange>>,
    server: Arc<Server>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_address(&self) -> &NodeAddress {
        &self.node_address
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// In-process broker the queue listener consumes from.
    pub fn queue(&self) -> &Arc<QueueBroker> {
        &self.queue
    }

    /// Capability exchange, when clustering is enabled.
    pub fn exchange(&self) -> Option<&Arc<ClusterExchange>> {
        self.exchange.as_ref()
    }

    /// Stops every listener.
    pub fn shutdown(&self) {
        tracing::info!("Node {} shutting down", self.node_address);
        self.server.shutdown();
        let _ = self.shutdown.send(());
    }

    /// Waits for every listener task to finish.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Node task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::config::SocketMode;
    use plexrpc_client::{
        Client, ConnectionConfig, DispatchOutcome, InvocationCallback, OneWayDispatch,
        ServiceQueueRouter,
    };
    use plexrpc_core::TransportKind;
    use plexrpc_protocol::InvocationDescriptor;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.http.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.metrics.bind_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_single_node_serves_socket_and_queue() {
        let node = Node::start(config(), builtin::catalog()).await.unwrap();
        assert_eq!(node.node_address(), &NodeAddress::from(node.socket_addr()));
        assert!(node.http_addr().is_none());
        assert!(node.exchange().is_none());

        let client = Client::new(ConnectionConfig::new(node.socket_addr()));
        client.connect().await.unwrap();
        let value = client
            .invoke(builtin::SERVICE, "ping", vec![json!({"n": 1})])
            .await
            .unwrap();
        assert_eq!(value, json!({"n": 1}));

        let sender = OneWayDispatch::new(node.queue().clone(), Arc::new(ServiceQueueRouter::new("rpc.")));
        let outcome = sender
            .dispatch(InvocationDescriptor::new(builtin::SERVICE, "ping", vec![json!(1)]))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Acknowledged));

        node.shutdown();
        tokio::time::timeout(Duration::from_secs(2), node.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_async_mode_with_http() {
        let mut config = config();
        config.network.mode = SocketMode::Async;
        config.http.enabled = true;
        let node = Node::start(config, builtin::catalog()).await.unwrap();
        assert!(node.http_addr().is_some());

        let client = Client::new(ConnectionConfig::new(node.socket_addr()));
        client.connect().await.unwrap();
        let value = client
            .invoke(builtin::SERVICE, "whoami", vec![])
            .await
            .unwrap();
        assert_eq!(value["transport"], TransportKind::AsyncSocket.as_str());

        node.shutdown();
    }

    #[tokio::test]
    async fn test_seed_cluster_exchanges_capabilities() {
        let mut b_config = config();
        b_config.cluster.enabled = true;
        let b = Node::start(b_config, builtin::catalog()).await.unwrap();

        let mut a_config = config();
        a_config.cluster.enabled = true;
        a_config.cluster.probe_interval_ms = 50;
        a_config.cluster.seeds = vec![b.node_address().clone()];
        let a = Node::start(a_config, builtin::catalog()).await.unwrap();

        let exchange = a.exchange().unwrap().clone();
        let mut served = Vec::new();
        for _ in 0..100 {
            served = exchange.peer_table().peers_serving(builtin::SERVICE);
            if !served.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(served, vec![b.node_address().clone()]);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_controller() {
        let mut config = config();
        config.controllers.push(plexrpc_core::ControllerBinding {
            service: "Missing".to_string(),
            method: "call".to_string(),
            transports: vec![TransportKind::Http],
            external: false,
        });
        let result = Node::start(config, builtin::catalog()).await;
        assert!(matches!(result, Err(ServerError::Registry(_))));
    }
}
