//! Typed stand-ins for remote service interfaces.
//!
//! A service interface is described by a [`ServiceInterface`] impl and
//! exposed to callers through a hand-written adapter that forwards each
//! method to [`ServiceProxy::invoke`]:
//!
//! ```ignore
//! struct EchoClient(ServiceProxy<EchoService>);
//!
//! impl EchoClient {
//!     async fn ping(&self, text: &str) -> Result<String, RpcError> {
//!         self.0.invoke("ping", vec![json!(text)]).await
//!     }
//! }
//! ```

use crate::dispatch::{DispatchOutcome, InvocationCallback};
use plexrpc_core::RpcError;
use plexrpc_protocol::InvocationDescriptor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// What a method hands back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Unit,
    Value,
}

/// One method of a service interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    pub arity: usize,
    pub returns: ReturnKind,
}

impl MethodSignature {
    pub const fn new(name: &'static str, arity: usize, returns: ReturnKind) -> Self {
        Self {
            name,
            arity,
            returns,
        }
    }
}

/// Static description of a remote service.
pub trait ServiceInterface {
    const SERVICE: &'static str;

    fn methods() -> &'static [MethodSignature];

    fn method(name: &str) -> Option<&'static MethodSignature> {
        Self::methods().iter().find(|m| m.name == name)
    }
}

/// Errors building a proxy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error(
        "one-way dispatch would discard the result of {service}.{method}; \
         use allow_discarded_returns() to accept default values"
    )]
    DiscardedReturn {
        service: &'static str,
        method: &'static str,
    },
}

/// Builds a [`ServiceProxy`].
pub struct ProxyBuilder<S> {
    callback: Arc<dyn InvocationCallback>,
    allow_discarded_returns: bool,
    _service: PhantomData<fn() -> S>,
}

impl<S: ServiceInterface> ProxyBuilder<S> {
    pub fn new(callback: Arc<dyn InvocationCallback>) -> Self {
        Self {
            callback,
            allow_discarded_returns: false,
            _service: PhantomData,
        }
    }

    /// Lets a one-way strategy serve methods that return values; such calls
    /// yield the return type's default value.
    pub fn allow_discarded_returns(mut self) -> Self {
        self.allow_discarded_returns = true;
        self
    }

    pub fn build(self) -> Result<ServiceProxy<S>, ProxyError> {
        if self.callback.mode().is_one_way() && !self.allow_discarded_returns {
            if let Some(method) = S::methods()
                .iter()
                .find(|m| m.returns == ReturnKind::Value)
            {
                return Err(ProxyError::DiscardedReturn {
                    service: S::SERVICE,
                    method: method.name,
                });
            }
        }
        Ok(ServiceProxy {
            callback: self.callback,
            _service: PhantomData,
        })
    }
}

/// Packages calls on `S` into invocation descriptors and dispatches them.
pub struct ServiceProxy<S> {
    callback: Arc<dyn InvocationCallback>,
    _service: PhantomData<fn() -> S>,
}

impl<S> Clone for ServiceProxy<S> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            _service: PhantomData,
        }
    }
}

impl<S: ServiceInterface> ServiceProxy<S> {
    pub fn builder(callback: Arc<dyn InvocationCallback>) -> ProxyBuilder<S> {
        ProxyBuilder::new(callback)
    }

    /// Calls a value-returning method.
    ///
    /// A one-way strategy yields `R::default()`.
    pub async fn invoke<R>(&self, method: &str, args: Vec<Value>) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Default,
    {
        match self.call(method, args).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                RpcError::internal(format!(
                    "cannot decode result of {}.{}: {}",
                    S::SERVICE,
                    method,
                    e
                ))
            }),
            None => Ok(R::default()),
        }
    }

    /// Calls a method without a result.
    pub async fn invoke_unit(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.call(method, args).await.map(|_| ())
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, RpcError> {
        let signature = S::method(method).ok_or_else(|| {
            RpcError::validation(format!("{} has no method {}", S::SERVICE, method))
        })?;
        if signature.arity != args.len() {
            return Err(RpcError::validation(format!(
                "{}.{} expects {} argument(s), got {}",
                S::SERVICE,
                method,
                signature.arity,
                args.len()
            )));
        }

        let invocation = InvocationDescriptor::new(S::SERVICE, method, args);
        tracing::debug!(
            "Dispatching {}.{} call_id={}",
            S::SERVICE,
            method,
            invocation.call_id
        );

        match self.callback.dispatch(invocation).await {
            DispatchOutcome::Delivered(value) => Ok(Some(value)),
            DispatchOutcome::Acknowledged => Ok(None),
            DispatchOutcome::Failed(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchMode, OneWayDispatch};
    use async_trait::async_trait;
    use plexrpc_core::{QueueBroker, QueueTransport};
    use plexrpc_protocol::{Decoder, Operation};
    use serde_json::json;
    use tokio_test::assert_ready;

    struct EchoService;

    impl ServiceInterface for EchoService {
        const SERVICE: &'static str = "Echo";

        fn methods() -> &'static [MethodSignature] {
            const METHODS: &[MethodSignature] = &[
                MethodSignature::new("ping", 1, ReturnKind::Value),
                MethodSignature::new("count", 0, ReturnKind::Value),
                MethodSignature::new("reset", 0, ReturnKind::Unit),
            ];
            METHODS
        }
    }

    /// Hand-written adapter over the proxy.
    struct EchoClient {
        proxy: ServiceProxy<EchoService>,
    }

    impl EchoClient {
        async fn ping(&self, text: &str) -> Result<String, RpcError> {
            self.proxy.invoke("ping", vec![json!(text)]).await
        }

        async fn count(&self) -> Result<u64, RpcError> {
            self.proxy.invoke("count", vec![]).await
        }

        async fn reset(&self) -> Result<(), RpcError> {
            self.proxy.invoke_unit("reset", vec![]).await
        }
    }

    struct Loopback;

    #[async_trait]
    impl InvocationCallback for Loopback {
        fn mode(&self) -> DispatchMode {
            DispatchMode::Blocking
        }

        async fn dispatch(&self, invocation: InvocationDescriptor) -> DispatchOutcome {
            match invocation.method.as_str() {
                "ping" => DispatchOutcome::Delivered(invocation.args[0].clone()),
                "count" => DispatchOutcome::Delivered(json!(7)),
                "reset" => DispatchOutcome::Delivered(Value::Null),
                other => DispatchOutcome::Failed(RpcError::routing_not_found(
                    invocation.service.clone(),
                    other,
                    "test",
                )),
            }
        }
    }

    fn queued(broker: &Arc<QueueBroker>) -> Arc<dyn InvocationCallback> {
        Arc::new(OneWayDispatch::new(
            broker.clone(),
            Arc::new(|_: &InvocationDescriptor| "echo-queue".to_string()),
        ))
    }

    #[tokio::test]
    async fn test_blocking_returns_delivered_value() {
        let client = EchoClient {
            proxy: ServiceProxy::builder(Arc::new(Loopback)).build().unwrap(),
        };
        assert_eq!(client.ping("hi").await.unwrap(), "hi");
        assert_eq!(client.count().await.unwrap(), 7);
        client.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_way_rejected_for_value_methods() {
        let broker = Arc::new(QueueBroker::new());
        let err = ServiceProxy::<EchoService>::builder(queued(&broker))
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProxyError::DiscardedReturn {
                service: "Echo",
                method: "ping"
            }
        );
    }

    #[tokio::test]
    async fn test_one_way_ping_returns_default_and_publishes() {
        let broker = Arc::new(QueueBroker::new());
        let client = EchoClient {
            proxy: ServiceProxy::builder(queued(&broker))
                .allow_discarded_returns()
                .build()
                .unwrap(),
        };

        // Completes on first poll: nothing waits for the queue consumer
        let mut call = tokio_test::task::spawn(client.ping("x"));
        let result = assert_ready!(call.poll());
        assert_eq!(result.unwrap(), String::new());

        assert_eq!(client.count().await.unwrap(), 0);
        client.reset().await.unwrap();

        let mut rx = broker.subscribe("echo-queue").unwrap();
        let frame = rx.recv().await.unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&frame);
        let request = decoder.decode_request().unwrap().unwrap();
        assert_eq!(request.op, Operation::Notify);

        let invocation: InvocationDescriptor = serde_json::from_value(request.params).unwrap();
        assert_eq!(
            (
                invocation.service.as_str(),
                invocation.method.as_str(),
                invocation.args
            ),
            ("Echo", "ping", vec![json!("x")])
        );
    }

    #[tokio::test]
    async fn test_unknown_method_and_arity() {
        let proxy: ServiceProxy<EchoService> =
            ServiceProxy::builder(Arc::new(Loopback)).build().unwrap();

        let err = proxy.invoke::<String>("shout", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::ValidationFailed { .. }));

        let err = proxy
            .invoke::<String>("ping", vec![json!("a"), json!("b")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expects 1"));
    }

    #[tokio::test]
    async fn test_undecodable_result() {
        let proxy: ServiceProxy<EchoService> =
            ServiceProxy::builder(Arc::new(Loopback)).build().unwrap();
        // "count" answers with a number
        let err = proxy.invoke::<Vec<String>>("count", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("cannot decode"));
    }
}
