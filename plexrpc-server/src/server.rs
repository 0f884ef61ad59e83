//! Socket listener.
//!
//! In [`SocketMode::Sync`] requests on one connection are served strictly in
//! order. In [`SocketMode::Async`] each INVOKE runs in its own task and its
//! response is written whenever it completes; clients correlate by id.

use crate::config::{NetworkConfig, SocketMode};
use crate::dispatcher::{CallSource, Dispatcher};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::{Session, SessionState, WireMode};
use bytes::BytesMut;
use plexrpc_core::TransportKind;
use plexrpc_protocol::codec::jsonl::{self, LineDecoder};
use plexrpc_protocol::message::{Operation, Request, Response};
use plexrpc_protocol::{Decoder, Encoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Socket listener configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    pub mode: SocketMode,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("mode", &self.mode)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            mode: network.mode,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: SocketMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Transport kind calls on this listener are routed under.
    pub fn transport_kind(&self) -> TransportKind {
        match self.mode {
            SocketMode::Sync => TransportKind::SyncSocket,
            SocketMode::Async => TransportKind::AsyncSocket,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Socket listener of a plexrpc node.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// Responses of async-mode calls wait here for the connection writer.
const RESPONSE_CHANNEL_CAPACITY: usize = 256;

impl Server {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Socket listener on {} ({})",
            listener.local_addr()?,
            self.config.transport_kind()
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let dispatcher = self.dispatcher.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    dispatcher,
                                    &config,
                                    &stats,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Socket listener shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);
        stream.set_nodelay(true).ok();

        let kind = config.transport_kind();
        let mut session = Session::new(addr);
        let mut reader = RequestReader::default();
        let mut buf = [0u8; 8192];

        // Completed async-mode calls
        let (response_tx, mut response_rx) = mpsc::channel::<Response>(RESPONSE_CHANNEL_CAPACITY);

        loop {
            tokio::select! {
                biased;

                Some(response) = response_rx.recv() => {
                    Self::write_response(&mut stream, &session, &response, addr).await?;
                    continue;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            reader.extend(&mut session, &buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout) => {
                    if session.idle_duration() > config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            while let Some(request) = reader.next(session.wire_mode())? {
                tracing::info!("[{}] Request: {} (id={})", addr, request.op.as_str(), request.id);
                stats.requests_total.fetch_add(1, Ordering::Relaxed);

                if config.mode == SocketMode::Async
                    && request.op == Operation::Invoke
                    && session.is_ready()
                {
                    session.record_request();
                    let source = CallSource::from_request(&session, &request);
                    let dispatcher = dispatcher.clone();
                    let tx = response_tx.clone();
                    tokio::spawn(async move {
                        let response = dispatcher.invoke(kind, request, source).await;
                        // The connection may be gone by now
                        let _ = tx.send(response).await;
                    });
                    continue;
                }

                let response = dispatcher.handle(kind, &mut session, request).await;
                if response.is_error() {
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                Self::write_response(&mut stream, &session, &response, addr).await?;

                if session.state() == SessionState::Closing {
                    tracing::debug!("[{}] Session closing", addr);
                    return Ok(());
                }
            }
        }
    }

    async fn write_response(
        stream: &mut TcpStream,
        session: &Session,
        response: &Response,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        tracing::info!(
            "[{}] Response: {} (id={})",
            addr,
            if response.is_ok() { "OK" } else { "ERROR" },
            response.id
        );

        let bytes = match session.wire_mode() {
            WireMode::BinaryJson => Encoder::encode_response(response)?,
            WireMode::Jsonl => BytesMut::from(&jsonl::encode(response)?[..]),
        };
        tracing::debug!("[{}] Writing {} bytes", addr, bytes.len());
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Splits the inbound byte stream into requests.
///
/// A connection whose first byte is `{` speaks line-delimited JSON from the
/// start; otherwise frames are expected until HELLO negotiates line mode.
#[derive(Default)]
struct RequestReader {
    frames: Decoder,
    lines: LineDecoder,
    sniffed: bool,
}

impl RequestReader {
    fn extend(&mut self, session: &mut Session, data: &[u8]) {
        if !self.sniffed {
            if let Some(&first) = data.iter().find(|b| !b.is_ascii_whitespace()) {
                self.sniffed = true;
                if first == b'{' {
                    session.set_wire_mode(WireMode::Jsonl);
                }
            }
        }
        match session.wire_mode() {
            WireMode::BinaryJson => self.frames.extend(data),
            WireMode::Jsonl => self.lines.extend(data),
        }
    }

    fn next(&mut self, mode: WireMode) -> Result<Option<Request>, ServerError> {
        match mode {
            WireMode::BinaryJson => Ok(self.frames.decode_request()?),
            WireMode::Jsonl => Ok(self.lines.decode_line()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use plexrpc_client::{Client, ConnectionConfig};
    use plexrpc_core::{CapabilityRegistry, RegistryBuilder};
    use plexrpc_protocol::{ErrorCode, NodeAddress};
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn dispatcher() -> Arc<Dispatcher> {
        let mut builder = RegistryBuilder::new(NodeAddress::from("127.0.0.1:7411"));
        builder
            .register_from_config(&builtin::catalog(), &builtin::default_bindings())
            .unwrap();
        let registry: Arc<CapabilityRegistry> = Arc::new(builder.build());
        Arc::new(Dispatcher::new(registry))
    }

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config, dispatcher()));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let client = Client::new(ConnectionConfig::new(addr).with_client_name("test"));
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_sync_invoke() {
        let (server, addr) = start(ServerConfig::default()).await;
        let client = connect(addr).await;

        client.ping().await.unwrap();
        let value = client.invoke("Echo", "ping", vec![json!("hi")]).await.unwrap();
        assert_eq!(value, json!("hi"));

        // sleep is only bound on the async socket kind
        let err = client.invoke("Echo", "sleep", vec![json!(1)]).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RoutingNotFound));

        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_async_mode_answers_out_of_order() {
        let config = ServerConfig::default().with_mode(SocketMode::Async);
        let (server, addr) = start(config).await;
        let client = Arc::new(connect(addr).await);

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.invoke("Echo", "sleep", vec![json!(300)]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A fast call on the same connection is not stuck behind the slow one
        let started = Instant::now();
        let value = client.invoke("Echo", "ping", vec![json!("fast")]).await.unwrap();
        assert_eq!(value, json!("fast"));
        assert!(started.elapsed() < Duration::from_millis(250));

        assert_eq!(slow.await.unwrap().unwrap(), json!(300));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_jsonl_session() {
        let (server, addr) = start(ServerConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"{\"type\":\"request\",\"id\":\"1\",\"op\":\"HELLO\",\"params\":{\"protocol_version\":1,\"wire_modes\":[\"binary_json\"]}}\n")
            .await
            .unwrap();
        let hello: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(hello.result.unwrap()["wire_mode"], "jsonl");

        write
            .write_all(b"{\"type\":\"request\",\"id\":\"2\",\"op\":\"INVOKE\",\"params\":{\"service\":\"Echo\",\"method\":\"ping\",\"args\":[42]}}\n")
            .await
            .unwrap();
        let response: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.id, "2");
        assert_eq!(response.result, Some(json!(42)));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(ServerConfig::default().with_max_connections(1)).await;
        let first = connect(addr).await;

        let second = Client::new(
            ConnectionConfig::new(addr).with_request_timeout(Duration::from_millis(300)),
        );
        assert!(second.connect().await.is_err());

        first.ping().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_bye_and_shutdown() {
        let (server, addr) = start(ServerConfig::default()).await;
        let client = connect(addr).await;
        client.bye().await.unwrap();
        assert!(!client.is_connected());

        assert!(server.is_running());
        server.shutdown();
        for _ in 0..50 {
            if !server.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not stop");
    }
}
