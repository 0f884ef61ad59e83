//! # plexrpc-protocol
//!
//! Wire protocol for plexrpc (PXP - plexrpc exchange protocol).
//!
//! This crate provides:
//! - Binary framing with length prefix, CRC32C validation and an out-of-band
//!   origin header
//! - JSON request/response envelopes shared by every transport
//! - Invocation descriptors and node capability snapshots
//! - Stable error codes for the RPC error taxonomy

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    InvocationDescriptor, NodeAddress, NodeCapabilitySnapshot, Operation, Request, RequestMeta,
    Response, ResponseError, ResponseStatus,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the plexrpc socket transport.
pub const DEFAULT_PORT: u16 = 7411;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Version tag advertised in capability snapshots.
pub fn version_tag() -> String {
    format!("pxp/{}", PROTOCOL_VERSION)
}
