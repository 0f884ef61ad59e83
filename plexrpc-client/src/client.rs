//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use plexrpc_protocol::message::*;
use serde_json::{json, Value};
use std::sync::Arc;

/// High-level client for a plexrpc node.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server and starts the background read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let conn = self.conn.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("Read loop for {} ended: {}", conn.config().addr, e);
            }
        });
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    async fn request(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        ClientError::check(self.conn.request(op, params).await?)
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Operation::Ping, json!({})).await?;
        Ok(())
    }

    /// Ends the session politely.
    pub async fn bye(&self) -> Result<(), ClientError> {
        self.request(Operation::Bye, json!({})).await?;
        self.close().await
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Invokes `service.method` and waits for its result.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        self.invoke_descriptor(InvocationDescriptor::new(service, method, args))
            .await
    }

    /// Sends a prepared invocation; the call id becomes the request id.
    pub async fn invoke_descriptor(
        &self,
        invocation: InvocationDescriptor,
    ) -> Result<Value, ClientError> {
        let request = invocation.into_request(Operation::Invoke)?;
        ClientError::check(self.conn.send(request).await?)
    }

    /// Sends a one-way invocation. Returns once the server accepted it.
    pub async fn notify(&self, invocation: InvocationDescriptor) -> Result<(), ClientError> {
        let request = invocation.into_request(Operation::Notify)?;
        ClientError::check(self.conn.send(request).await?)?;
        Ok(())
    }

    // =========================================================================
    // Capability exchange
    // =========================================================================

    /// Fetches the node's capability snapshot.
    pub async fn node_configuration(&self) -> Result<NodeCapabilitySnapshot, ClientError> {
        let result = self
            .request(Operation::GetNodeConfiguration, json!({}))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Pushes a capability snapshot to the node.
    pub async fn push_node_configuration(
        &self,
        snapshot: &NodeCapabilitySnapshot,
    ) -> Result<(), ClientError> {
        self.request(
            Operation::OnNodeConfiguration,
            serde_json::to_value(snapshot)?,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1:7411".parse().unwrap()));
        assert!(!client.is_connected());
        assert_eq!(client.connection().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_requires_connection() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1:7411".parse().unwrap()));
        let err = client
            .invoke("Echo", "ping", vec![json!("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
