//! Transport kinds a controller can be exposed on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A delivery channel that can carry invocations to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Socket transport, one request at a time per connection.
    SyncSocket,
    /// Socket transport, concurrent requests correlated by id.
    AsyncSocket,
    Http,
    BrowserSocket,
    /// Group communication between cluster nodes.
    Cluster,
    /// One-way message queue.
    Queue,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::SyncSocket,
        TransportKind::AsyncSocket,
        TransportKind::Http,
        TransportKind::BrowserSocket,
        TransportKind::Cluster,
        TransportKind::Queue,
    ];

    /// Whether a service exposed on this kind is reachable from outside the
    /// cluster. Only the cluster transport is internal.
    pub fn is_external(&self) -> bool {
        !matches!(self, TransportKind::Cluster)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::SyncSocket => "sync_socket",
            TransportKind::AsyncSocket => "async_socket",
            TransportKind::Http => "http",
            TransportKind::BrowserSocket => "browser_socket",
            TransportKind::Cluster => "cluster",
            TransportKind::Queue => "queue",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown transport kind: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_serde() {
        for kind in TransportKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("carrier_pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_only_cluster_is_internal() {
        let internal: Vec<_> = TransportKind::ALL
            .into_iter()
            .filter(|k| !k.is_external())
            .collect();
        assert_eq!(internal, vec![TransportKind::Cluster]);
    }
}
