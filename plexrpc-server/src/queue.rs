//! Queue listener.
//!
//! Subscribes `<prefix><service>` for every service with a queue route and
//! runs the NOTIFY frames found there one at a time, in queue order.

use crate::dispatcher::{CallSource, Dispatcher};
use crate::error::ServerError;
use bytes::Bytes;
use plexrpc_core::{QueueReceiver, QueueTransport, TransportKind};
use plexrpc_protocol::message::{InvocationDescriptor, Operation, Request};
use plexrpc_protocol::Decoder;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct QueueListener {
    transport: Arc<dyn QueueTransport>,
    dispatcher: Arc<Dispatcher>,
    prefix: String,
}

impl QueueListener {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        dispatcher: Arc<Dispatcher>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            prefix: prefix.into(),
        }
    }

    /// Queue names this node consumes.
    pub fn queues(&self) -> Vec<String> {
        let services: BTreeSet<&str> = self
            .dispatcher
            .registry()
            .routes(TransportKind::Queue)
            .into_iter()
            .map(|(service, _)| service)
            .collect();
        services
            .into_iter()
            .map(|service| format!("{}{}", self.prefix, service))
            .collect()
    }

    /// Subscribes every queue and starts one consumer task per queue.
    pub fn start(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>, ServerError> {
        let mut tasks = Vec::new();
        for queue in self.queues() {
            let receiver = self.transport.subscribe(&queue)?;
            tracing::info!("Consuming queue {}", queue);
            tasks.push(tokio::spawn(consume(
                receiver,
                self.dispatcher.clone(),
                shutdown.subscribe(),
            )));
        }
        Ok(tasks)
    }
}

async fn consume(
    mut receiver: QueueReceiver,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            payload = receiver.recv() => {
                let Some(payload) = payload else {
                    tracing::debug!("Queue {} closed", receiver.queue());
                    break;
                };
                match decode(payload) {
                    Ok((invocation, source)) => {
                        // Failures are logged by the dispatcher
                        let _ = dispatcher.call(TransportKind::Queue, invocation, source).await;
                    }
                    Err(e) => {
                        tracing::warn!("Discarding message on {}: {}", receiver.queue(), e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Queue consumer {} shutting down", receiver.queue());
                break;
            }
        }
    }
}

fn decode(payload: Bytes) -> Result<(InvocationDescriptor, CallSource), ServerError> {
    let mut decoder = Decoder::new();
    decoder.extend_bytes(payload);
    let request: Request = decoder
        .decode_request()?
        .ok_or_else(|| ServerError::InvalidRequest("truncated frame".to_string()))?;
    if request.op != Operation::Notify {
        return Err(ServerError::InvalidRequest(format!(
            "unexpected {} on a queue",
            request.op.as_str()
        )));
    }

    let mut invocation: InvocationDescriptor = serde_json::from_value(request.params)?;
    if invocation.call_id.is_empty() {
        invocation.call_id = request.id;
    }
    let source = CallSource {
        peer: request.meta.origin,
        attributes: request.meta.attributes,
    };
    Ok((invocation, source))
}
