//! Per-call request context.

use crate::transport::TransportKind;
use plexrpc_protocol::NodeAddress;
use std::collections::BTreeMap;

/// Attribute key that disables profiling for a call.
pub const SKIP_PROFILING: &str = "skip_profiling";
/// Attribute key that disables lazy relation loading for a call.
pub const SKIP_LAZY_RELATIONS: &str = "skip_lazy_relations";

/// State carried through one controller invocation.
///
/// Built by the transport adapter when a request is decoded and dropped when
/// the lifecycle finishes. Each call gets its own context.
#[derive(Debug)]
pub struct RequestContext {
    transport: TransportKind,
    peer: Option<NodeAddress>,
    call_id: String,
    attributes: BTreeMap<String, String>,
    skip_profiling: bool,
    skip_lazy_relations: bool,
}

impl RequestContext {
    pub fn new(transport: TransportKind, call_id: impl Into<String>) -> Self {
        Self {
            transport,
            peer: None,
            call_id: call_id.into(),
            attributes: BTreeMap::new(),
            skip_profiling: false,
            skip_lazy_relations: false,
        }
    }

    /// Sets the originating peer address.
    pub fn with_peer(mut self, peer: Option<NodeAddress>) -> Self {
        self.peer = peer;
        self
    }

    /// Merges attributes; the well-known flag keys also set the flags.
    pub fn with_attributes<'a, I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in attributes {
            self.set_attribute(key.clone(), value.clone());
        }
        self
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn peer(&self) -> Option<&NodeAddress> {
        self.peer.as_ref()
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            SKIP_PROFILING => self.skip_profiling = is_truthy(&value),
            SKIP_LAZY_RELATIONS => self.skip_lazy_relations = is_truthy(&value),
            _ => {}
        }
        self.attributes.insert(key, value);
    }

    pub fn skip_profiling(&self) -> bool {
        self.skip_profiling
    }

    pub fn set_skip_profiling(&mut self, skip: bool) {
        self.skip_profiling = skip;
    }

    pub fn skip_lazy_relations(&self) -> bool {
        self.skip_lazy_relations
    }

    pub fn set_skip_lazy_relations(&mut self, skip: bool) {
        self.skip_lazy_relations = skip;
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_attributes() {
        let mut attrs = BTreeMap::new();
        attrs.insert(SKIP_PROFILING.to_string(), "true".to_string());
        attrs.insert("tenant".to_string(), "acme".to_string());

        let ctx = RequestContext::new(TransportKind::Http, "c-1").with_attributes(&attrs);
        assert!(ctx.skip_profiling());
        assert!(!ctx.skip_lazy_relations());
        assert_eq!(ctx.attribute("tenant"), Some("acme"));
    }

    #[test]
    fn test_later_attribute_overrides() {
        let mut ctx = RequestContext::new(TransportKind::SyncSocket, "c-2");
        ctx.set_attribute(SKIP_LAZY_RELATIONS, "1");
        assert!(ctx.skip_lazy_relations());
        ctx.set_attribute(SKIP_LAZY_RELATIONS, "false");
        assert!(!ctx.skip_lazy_relations());
    }
}
