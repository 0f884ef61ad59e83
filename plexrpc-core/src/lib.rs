//! # plexrpc-core
//!
//! Transport-agnostic dispatch core for plexrpc.
//!
//! This crate provides:
//! - The capability registry mapping `(service, method, transport)` to exactly
//!   one controller
//! - The controller trait and its per-call lifecycle
//! - Request contexts, transport kinds and the RPC error taxonomy
//! - The queue transport seam with an in-process broker

pub mod context;
pub mod controller;
pub mod error;
pub mod observer;
pub mod queue;
pub mod registry;
pub mod transport;

pub use context::RequestContext;
pub use controller::{Controller, ControllerCall, ControllerFactory, FnController, LifecycleState};
pub use error::{FailureKind, HandlerError, RegistryError, RpcError, ValidationError};
pub use observer::{CompletedRequest, NoopObserver, RequestObserver};
pub use queue::{QueueBroker, QueueError, QueueReceiver, QueueTransport};
pub use registry::{
    CapabilityRegistry, ControllerBinding, ControllerCatalog, ControllerDescriptor, HandlerId,
    RegistryBuilder,
};
pub use transport::TransportKind;
