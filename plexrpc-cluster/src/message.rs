//! Messages carried over the group transport.
//!
//! Cluster messages travel as ordinary PXP request frames flagged `CLUSTER`.
//! The sender's address is stamped into the frame origin header.

use crate::error::ClusterError;
use bytes::Bytes;
use plexrpc_protocol::frame::FrameFlags;
use plexrpc_protocol::{
    Decoder, Encoder, InvocationDescriptor, NodeAddress, NodeCapabilitySnapshot, Operation,
    Request,
};

/// A message exchanged between cluster members.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Asks the receiver for its capability snapshot.
    GetNodeConfiguration,
    /// Carries the sender's capability snapshot, solicited or not.
    OnNodeConfiguration(NodeCapabilitySnapshot),
    /// One-way invocation addressed to the cluster transport.
    Invocation(InvocationDescriptor),
}

/// A decoded message with the sender taken from the frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: Option<NodeAddress>,
    pub message: ClusterMessage,
}

impl ClusterMessage {
    pub fn operation(&self) -> Operation {
        match self {
            ClusterMessage::GetNodeConfiguration => Operation::GetNodeConfiguration,
            ClusterMessage::OnNodeConfiguration(_) => Operation::OnNodeConfiguration,
            ClusterMessage::Invocation(_) => Operation::Notify,
        }
    }

    /// Builds the request envelope for this message.
    pub fn to_request(&self, origin: &NodeAddress) -> Result<Request, ClusterError> {
        let request = match self {
            ClusterMessage::GetNodeConfiguration => {
                Request::new(uuid::Uuid::new_v4().to_string(), self.operation())
            }
            ClusterMessage::OnNodeConfiguration(snapshot) => {
                Request::new(uuid::Uuid::new_v4().to_string(), self.operation())
                    .with_params(serde_json::to_value(snapshot)?)
            }
            ClusterMessage::Invocation(invocation) => {
                invocation.clone().into_request(self.operation())?
            }
        };
        Ok(request.with_origin(origin.clone()))
    }

    /// Rebuilds a message from a request envelope.
    pub fn from_request(request: Request) -> Result<Envelope, ClusterError> {
        let message = match request.op {
            Operation::GetNodeConfiguration => ClusterMessage::GetNodeConfiguration,
            Operation::OnNodeConfiguration => {
                ClusterMessage::OnNodeConfiguration(serde_json::from_value(request.params)?)
            }
            Operation::Notify | Operation::Invoke => {
                ClusterMessage::Invocation(serde_json::from_value(request.params)?)
            }
            other => return Err(ClusterError::UnexpectedOperation(other)),
        };
        Ok(Envelope {
            origin: request.meta.origin,
            message,
        })
    }

    /// Encodes the message into a cluster frame.
    pub fn encode(&self, origin: &NodeAddress) -> Result<Bytes, ClusterError> {
        let request = self.to_request(origin)?;
        let mut flags = FrameFlags::new().with_cluster();
        if matches!(self, ClusterMessage::Invocation(_)) {
            flags = flags.with_one_way();
        }
        Ok(Encoder::encode_from(&request, origin, flags)?.freeze())
    }

    /// Decodes one cluster frame.
    pub fn decode(frame: &[u8]) -> Result<Envelope, ClusterError> {
        let mut decoder = Decoder::new();
        decoder.extend(frame);
        let request = decoder
            .decode_request()?
            .ok_or(ClusterError::TruncatedFrame)?;
        Self::from_request(request)
    }
}
