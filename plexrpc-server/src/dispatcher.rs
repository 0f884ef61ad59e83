//! Request dispatch shared by every transport listener.
//!
//! Socket listeners hand whole requests to [`Dispatcher::handle`]; the HTTP,
//! queue and cluster listeners decode their own envelopes and go straight to
//! [`Dispatcher::call`].

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::{Session, SessionState, WireMode};
use chrono::Utc;
use plexrpc_cluster::{ClusterMessage, GroupEvent};
use plexrpc_core::{
    CapabilityRegistry, CompletedRequest, ControllerCall, NoopObserver, RequestContext,
    RequestObserver, RpcError, TransportKind,
};
use plexrpc_protocol::message::{
    HelloParams, HelloResult, InvocationDescriptor, NotifyResult, Operation, Request, Response,
    ResponseError, ResponseMeta,
};
use plexrpc_protocol::{NodeAddress, NodeCapabilitySnapshot, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Server information returned by HELLO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "plexrpc".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Who a call came from.
#[derive(Debug, Clone, Default)]
pub struct CallSource {
    pub peer: Option<NodeAddress>,
    pub attributes: BTreeMap<String, String>,
}

impl CallSource {
    pub fn new(peer: Option<NodeAddress>) -> Self {
        Self {
            peer,
            attributes: BTreeMap::new(),
        }
    }

    /// Builds the source of a socket request: the request origin wins over
    /// the connection address, request attributes over session attributes.
    pub fn from_request(session: &Session, request: &Request) -> Self {
        let mut attributes = session.attributes().clone();
        attributes.extend(
            request
                .meta
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self {
            peer: request.meta.origin.clone().or_else(|| Some(session.peer())),
            attributes,
        }
    }
}

/// Routes decoded requests to controllers.
pub struct Dispatcher {
    info: ServerInfo,
    registry: Arc<CapabilityRegistry>,
    observer: Arc<dyn RequestObserver>,
    cluster_inbox: Option<mpsc::UnboundedSender<GroupEvent>>,
    mask_handler_errors: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            info: ServerInfo::default(),
            registry,
            observer: Arc::new(NoopObserver),
            cluster_inbox: None,
            mask_handler_errors: false,
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Reports completed calls to Prometheus.
    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        self.with_observer(metrics)
    }

    /// Feeds ON_NODE_CONFIGURATION pushes received over sockets into the
    /// cluster exchange.
    pub fn with_cluster_inbox(mut self, inbox: mpsc::UnboundedSender<GroupEvent>) -> Self {
        self.cluster_inbox = Some(inbox);
        self
    }

    /// Hides handler failure details from callers. The full error is logged.
    pub fn with_masked_errors(mut self, mask: bool) -> Self {
        self.mask_handler_errors = mask;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn node_address(&self) -> &NodeAddress {
        self.registry.node_address()
    }

    pub fn snapshot(&self) -> NodeCapabilitySnapshot {
        self.registry.snapshot()
    }

    /// Runs one invocation through the controller lifecycle.
    pub async fn call(
        &self,
        kind: TransportKind,
        invocation: InvocationDescriptor,
        source: CallSource,
    ) -> Result<Value, RpcError> {
        let started = Instant::now();
        let InvocationDescriptor {
            service,
            method,
            args,
            call_id,
        } = invocation;

        let result = match self.registry.resolve(&service, &method, kind) {
            Ok(descriptor) => {
                let ctx = RequestContext::new(kind, call_id)
                    .with_peer(source.peer)
                    .with_attributes(&source.attributes);
                let (result, ctx) = ControllerCall::new(descriptor.create(), ctx)
                    .run(args)
                    .await;
                if !ctx.skip_profiling() {
                    tracing::debug!(
                        "{}.{} on {} took {:?} (call_id={})",
                        service,
                        method,
                        kind,
                        started.elapsed(),
                        ctx.call_id()
                    );
                }
                result
            }
            Err(e) => Err(e),
        };

        self.observer.request_completed(&CompletedRequest {
            transport: kind,
            service: &service,
            method: &method,
            elapsed: started.elapsed(),
            error: result.as_ref().err().map(RpcError::error_code),
        });

        if let Err(e) = &result {
            tracing::warn!("{}.{} on {} failed: {}", service, method, kind, e);
        }
        result
    }

    /// Converts a call failure for the wire, masking handler details if set.
    pub fn wire_error(&self, error: RpcError) -> ResponseError {
        if self.mask_handler_errors {
            error.masked().to_response_error()
        } else {
            error.to_response_error()
        }
    }

    /// Handles an INVOKE request and builds its response.
    pub async fn invoke(
        &self,
        kind: TransportKind,
        request: Request,
        source: CallSource,
    ) -> Response {
        let id = request.id.clone();
        let result = match parse_invocation(&request) {
            Ok(invocation) => self.call(kind, invocation, source).await,
            Err(e) => Err(e),
        };
        self.respond(&id, result)
    }

    /// Handles a NOTIFY request: the call is checked for a route, started in
    /// the background and acknowledged at once.
    pub fn notify(
        self: &Arc<Self>,
        kind: TransportKind,
        request: Request,
        source: CallSource,
    ) -> Response {
        let invocation = match parse_invocation(&request) {
            Ok(invocation) => invocation,
            Err(e) => return self.respond(&request.id, Err(e)),
        };
        if let Err(e) = self
            .registry
            .resolve(&invocation.service, &invocation.method, kind)
        {
            return self.respond(&request.id, Err(e));
        }

        let call_id = invocation.call_id.clone();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            // Failures are already logged by `call`
            let _ = dispatcher.call(kind, invocation, source).await;
        });

        self.respond(
            &request.id,
            serde_json::to_value(NotifyResult {
                accepted: true,
                call_id,
            })
            .map_err(|e| RpcError::internal(e.to_string())),
        )
    }

    /// Handles a socket request.
    pub async fn handle(
        self: &Arc<Self>,
        kind: TransportKind,
        session: &mut Session,
        request: Request,
    ) -> Response {
        session.record_request();
        let kind = if session.is_cluster_link() {
            TransportKind::Cluster
        } else {
            kind
        };

        let result = match request.op {
            Operation::Hello => self.handle_hello(session, &request),
            Operation::Ping => Ok(json!({"pong": true})),
            Operation::Bye => self.handle_bye(session),
            Operation::GetNodeConfiguration => {
                serde_json::to_value(self.snapshot()).map_err(ServerError::from)
            }
            Operation::OnNodeConfiguration => self.handle_node_configuration(session, &request),
            Operation::Invoke | Operation::Notify if !session.is_ready() => {
                Err(ServerError::HandshakeRequired(request.op.as_str()))
            }
            Operation::Invoke => {
                let source = CallSource::from_request(session, &request);
                return self.invoke(kind, request, source).await;
            }
            Operation::Notify => {
                let source = CallSource::from_request(session, &request);
                return self.notify(kind, request, source);
            }
        };

        match result {
            Ok(value) => Response::ok(&request.id, value).with_meta(self.response_meta()),
            Err(e) => Response::error(
                &request.id,
                ResponseError::new(e.error_code(), e.to_string()),
            ),
        }
    }

    fn respond(&self, id: &str, result: Result<Value, RpcError>) -> Response {
        match result {
            Ok(value) => Response::ok(id, value).with_meta(self.response_meta()),
            Err(e) => {
                if self.mask_handler_errors {
                    if let RpcError::HandlerFailed { .. } = &e {
                        tracing::error!("Masked handler failure (id={}): {}", id, e);
                    }
                }
                Response::error(id, self.wire_error(e))
            }
        }
    }

    fn response_meta(&self) -> ResponseMeta {
        ResponseMeta {
            server_time: Some(Utc::now()),
            node: Some(self.node_address().clone()),
            ..Default::default()
        }
    }

    fn handle_hello(&self, session: &mut Session, request: &Request) -> Result<Value, ServerError> {
        let hello: HelloParams = serde_json::from_value(request.params.clone())
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::InvalidRequest(format!(
                "unsupported protocol version: {}",
                hello.protocol_version
            )));
        }

        let wire_mode = match session.wire_mode() {
            // A session that opened in line mode stays there
            WireMode::Jsonl => WireMode::Jsonl,
            WireMode::BinaryJson => WireMode::negotiate(&hello.wire_modes),
        };
        session.complete_handshake(
            hello.protocol_version,
            wire_mode,
            hello.client_name,
            hello.attributes,
        );
        session.set_origin(request.meta.origin.clone());

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            wire_mode: wire_mode.as_str().to_string(),
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            node_address: self.node_address().clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_bye(&self, session: &mut Session) -> Result<Value, ServerError> {
        session.set_state(SessionState::Closing);
        Ok(json!({"goodbye": true}))
    }

    fn handle_node_configuration(
        &self,
        session: &Session,
        request: &Request,
    ) -> Result<Value, ServerError> {
        // The sender is the link's handshake identity, never the request's own claim
        let Some(origin) = session.link_origin().cloned() else {
            tracing::warn!(
                "Rejected node configuration push from {} (not a cluster link)",
                session.remote_addr
            );
            return Err(ServerError::InvalidRequest(
                "node configuration pushes are only accepted on cluster links".to_string(),
            ));
        };
        let snapshot: NodeCapabilitySnapshot = serde_json::from_value(request.params.clone())
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        let Some(inbox) = &self.cluster_inbox else {
            tracing::debug!("Node configuration push ignored: cluster disabled");
            return Ok(json!({"accepted": false}));
        };

        let frame = ClusterMessage::OnNodeConfiguration(snapshot).encode(&origin)?;
        inbox
            .send(GroupEvent::Message(frame))
            .map_err(|_| ServerError::ShuttingDown)?;
        Ok(json!({"accepted": true}))
    }
}

fn parse_invocation(request: &Request) -> Result<InvocationDescriptor, RpcError> {
    let mut invocation: InvocationDescriptor = serde_json::from_value(request.params.clone())
        .map_err(|e| RpcError::validation(format!("invalid invocation: {}", e)))?;
    if invocation.call_id.is_empty() {
        invocation.call_id = request.id.clone();
    }
    Ok(invocation)
}
