//! Message-queue transport seam and an in-process broker.
//!
//! Queues are point-to-point: every published payload is delivered to the
//! single subscriber of that queue, in publish order. Payloads published
//! before anyone subscribes are buffered.

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue closed: {0}")]
    Closed(String),

    #[error("queue already has a subscriber: {0}")]
    AlreadySubscribed(String),
}

/// A message queue provider.
pub trait QueueTransport: Send + Sync {
    /// Enqueues a payload. Never waits for the consumer.
    fn publish(&self, queue: &str, payload: Bytes) -> Result<(), QueueError>;

    /// Attaches the consumer of a queue.
    fn subscribe(&self, queue: &str) -> Result<QueueReceiver, QueueError>;
}

/// Consuming end of a queue.
#[derive(Debug)]
pub struct QueueReceiver {
    queue: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl QueueReceiver {
    pub fn new(queue: impl Into<String>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next payload. `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

struct QueueSlot {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-memory queue broker.
#[derive(Default)]
pub struct QueueBroker {
    queues: DashMap<String, QueueSlot>,
}

impl QueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queues that have been used.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl QueueTransport for QueueBroker {
    fn publish(&self, queue: &str, payload: Bytes) -> Result<(), QueueError> {
        let slot = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        slot.tx
            .send(payload)
            .map_err(|_| QueueError::Closed(queue.to_string()))
    }

    fn subscribe(&self, queue: &str) -> Result<QueueReceiver, QueueError> {
        let mut slot = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);

        // Previous consumer went away; start a fresh queue
        if slot.rx.is_none() && slot.tx.is_closed() {
            *slot = QueueSlot::new();
        }

        match slot.rx.take() {
            Some(rx) => {
                tracing::debug!("Subscribed to queue {}", queue);
                Ok(QueueReceiver::new(queue, rx))
            }
            None => Err(QueueError::AlreadySubscribed(queue.to_string())),
        }
    }
}
