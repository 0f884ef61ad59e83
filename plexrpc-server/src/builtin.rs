//! Built-in `Echo` service, served by every node out of the box.

use async_trait::async_trait;
use plexrpc_core::{
    Controller, ControllerBinding, ControllerCatalog, FnController, HandlerError, RequestContext,
    TransportKind, ValidationError,
};
use serde_json::{json, Value};
use std::time::Duration;

pub const SERVICE: &str = "Echo";

/// Longest delay `Echo.sleep` accepts.
const MAX_SLEEP_MS: u64 = 10_000;

/// `Echo.ping(value)` returns its argument.
pub fn ping() -> FnController {
    FnController::new(1, |_, args| Ok(args[0].clone()))
}

/// `Echo.whoami()` describes the call as the node saw it.
pub fn whoami() -> FnController {
    FnController::new(0, |ctx, _| {
        Ok(json!({
            "transport": ctx.transport(),
            "peer": ctx.peer(),
            "call_id": ctx.call_id(),
            "attributes": ctx.attributes(),
        }))
    })
}

/// `Echo.sleep(millis)` waits, then returns the delay.
#[derive(Debug, Default)]
pub struct Sleep {
    millis: u64,
}

#[async_trait]
impl Controller for Sleep {
    fn setup(&mut self, _ctx: &mut RequestContext, args: Vec<Value>) -> Result<(), ValidationError> {
        let [millis]: [Value; 1] = args
            .try_into()
            .map_err(|a: Vec<Value>| ValidationError::arity(1, a.len()))?;
        self.millis = serde_json::from_value(millis)?;
        if self.millis > MAX_SLEEP_MS {
            return Err(ValidationError::new(format!(
                "sleep of {}ms exceeds {}ms",
                self.millis, MAX_SLEEP_MS
            )));
        }
        Ok(())
    }

    async fn handle(&mut self, _ctx: &RequestContext) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(json!(self.millis))
    }
}

/// Catalog with every built-in controller.
pub fn catalog() -> ControllerCatalog {
    let mut catalog = ControllerCatalog::new();
    catalog
        .insert(SERVICE, "ping", ping())
        .insert(SERVICE, "whoami", whoami())
        .insert(SERVICE, "sleep", Sleep::default);
    catalog
}

/// Bindings used when the configuration names none.
pub fn default_bindings() -> Vec<ControllerBinding> {
    let binding = |method: &str, transports: &[TransportKind]| ControllerBinding {
        service: SERVICE.to_string(),
        method: method.to_string(),
        transports: transports.to_vec(),
        external: false,
    };
    vec![
        binding(
            "ping",
            &[
                TransportKind::SyncSocket,
                TransportKind::AsyncSocket,
                TransportKind::Http,
                TransportKind::Cluster,
                TransportKind::Queue,
            ],
        ),
        binding(
            "whoami",
            &[
                TransportKind::SyncSocket,
                TransportKind::AsyncSocket,
                TransportKind::Http,
            ],
        ),
        binding("sleep", &[TransportKind::AsyncSocket, TransportKind::Http]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_core::{ControllerCall, ControllerFactory, RegistryBuilder, RpcError};
    use plexrpc_protocol::NodeAddress;

    #[test]
    fn test_default_bindings_resolve() {
        let mut builder = RegistryBuilder::new(NodeAddress::from("127.0.0.1:7411"));
        builder
            .register_from_config(&catalog(), &default_bindings())
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 3);
        assert!(registry
            .resolve(SERVICE, "ping", TransportKind::Queue)
            .is_ok());
        assert!(registry
            .resolve(SERVICE, "sleep", TransportKind::SyncSocket)
            .is_err());
        assert!(registry.snapshot().serves(SERVICE));
    }

    #[tokio::test]
    async fn test_sleep_bounds() {
        let ctx = RequestContext::new(TransportKind::Http, "c");
        let (result, _) = ControllerCall::new(Sleep::default.create(), ctx)
            .run(vec![json!(MAX_SLEEP_MS + 1)])
            .await;
        assert!(matches!(result, Err(RpcError::ValidationFailed { .. })));

        let ctx = RequestContext::new(TransportKind::Http, "c");
        let (result, _) = ControllerCall::new(Sleep::default.create(), ctx)
            .run(vec![json!(1)])
            .await;
        assert_eq!(result.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_whoami_reports_context() {
        let ctx = RequestContext::new(TransportKind::Cluster, "c-7")
            .with_peer(Some(NodeAddress::from("10.0.0.2:7411")));
        let (result, _) = ControllerCall::new(whoami().create(), ctx).run(vec![]).await;
        let value = result.unwrap();
        assert_eq!(value["transport"], "cluster");
        assert_eq!(value["peer"], "10.0.0.2:7411");
        assert_eq!(value["call_id"], "c-7");
    }
}
