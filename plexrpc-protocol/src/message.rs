//! JSON message types for PXP requests, responses and capability exchange.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;

/// PXP operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Session management
    Hello,
    Ping,
    Bye,

    // Calls
    /// Request/response invocation.
    Invoke,
    /// One-way invocation; answered with an acknowledgement only.
    Notify,

    // Capability exchange
    GetNodeConfiguration,
    OnNodeConfiguration,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Hello => "HELLO",
            Operation::Ping => "PING",
            Operation::Bye => "BYE",
            Operation::Invoke => "INVOKE",
            Operation::Notify => "NOTIFY",
            Operation::GetNodeConfiguration => "GET_NODE_CONFIGURATION",
            Operation::OnNodeConfiguration => "ON_NODE_CONFIGURATION",
        }
    }
}

/// Opaque transport address of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the address as a socket address, when it is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Transport-neutral description of one proxied call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub service: String,
    pub method: String,
    /// Arguments in declaration order.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Empty when the caller left correlation to the request id.
    #[serde(default)]
    pub call_id: String,
}

impl InvocationDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
            call_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    /// Wraps the descriptor into a request envelope.
    pub fn into_request(self, op: Operation) -> Result<Request, serde_json::Error> {
        let id = self.call_id.clone();
        Ok(Request::new(id, op).with_params(serde_json::to_value(self)?))
    }
}

/// Snapshot of the services a node serves to the outside.
///
/// Fields are read-only; a changed capability set produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilitySnapshot {
    version_tag: String,
    node_address: NodeAddress,
    external_services: BTreeSet<String>,
}

impl NodeCapabilitySnapshot {
    pub fn new(
        version_tag: impl Into<String>,
        node_address: NodeAddress,
        external_services: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            version_tag: version_tag.into(),
            node_address,
            external_services: external_services.into_iter().collect(),
        }
    }

    pub fn version_tag(&self) -> &str {
        &self.version_tag
    }

    pub fn node_address(&self) -> &NodeAddress {
        &self.node_address
    }

    pub fn external_services(&self) -> &BTreeSet<String> {
        &self.external_services
    }

    pub fn serves(&self, service: &str) -> bool {
        self.external_services.contains(service)
    }
}

/// Out-of-band request metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Node address of the sender, when the sender is a cluster node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeAddress>,

    /// Per-call attributes merged over the connection attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl RequestMeta {
    fn is_empty(&self) -> bool {
        self.origin.is_none() && self.attributes.is_empty()
    }
}

/// Request message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Unique request ID for correlation.
    pub id: String,

    pub op: Operation,

    #[serde(default)]
    pub params: Value,

    #[serde(default, skip_serializing_if = "RequestMeta::is_empty")]
    pub meta: RequestMeta,
}

impl Request {
    pub fn new(id: impl Into<String>, op: Operation) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op,
            params: Value::Object(Default::default()),
            meta: RequestMeta::default(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_origin(mut self, origin: NodeAddress) -> Self {
        self.meta.origin = Some(origin);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.attributes.insert(key.into(), value.into());
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

/// Response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,

    /// Address of the node that served the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeAddress>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Response message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID this response correlates to.
    pub id: String,

    pub status: ResponseStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,

    #[serde(default, skip_serializing_if = "is_meta_empty")]
    pub meta: ResponseMeta,
}

fn is_meta_empty(meta: &ResponseMeta) -> bool {
    meta.server_time.is_none() && meta.node.is_none() && meta.extra.is_empty()
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
            meta: ResponseMeta::default(),
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
            meta: ResponseMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub wire_modes: Vec<String>,
    /// Connection-scoped attributes copied into every call's context.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Result for HELLO response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub wire_mode: String,
    pub server_name: String,
    pub server_version: String,
    pub node_address: NodeAddress,
}

/// Result for NOTIFY responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResult {
    pub accepted: bool,
    pub call_id: String,
}
