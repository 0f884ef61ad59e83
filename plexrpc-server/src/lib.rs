//! # plexrpc-server
//!
//! The plexrpc node.
//!
//! This crate provides:
//! - Socket listener in sync and async modes, framed or line-delimited JSON
//! - HTTP and message-queue listeners
//! - Cluster wiring: the capability exchange loop and seed-list membership
//! - Request dispatch through the capability registry
//! - Configuration, sessions and Prometheus metrics

pub mod builtin;
pub mod cluster_link;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod server;
pub mod session;

pub use cluster_link::{ClusterListener, LinkConfig, SeedGroup};
pub use config::{Config, ConfigError, NetworkConfig, SocketMode};
pub use dispatcher::{CallSource, Dispatcher, ServerInfo};
pub use error::ServerError;
pub use http::HttpListener;
pub use metrics::Metrics;
pub use node::{Node, NodeHandle};
pub use queue::QueueListener;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState, WireMode};
