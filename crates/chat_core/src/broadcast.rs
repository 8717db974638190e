//! Fan-out of a response to every registered connection.

use crate::connection::{Connection, ConnectionId};
use crate::error::RelayError;
use crate::protocol::ServerResponse;
use crate::registry::Registry;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Sends responses to everyone in the registry, evicting connections that
/// cannot be written to.
///
/// Delivery is best effort: a failed or timed out write is not retried, the
/// connection is closed and removed, and the remaining connections still get
/// the response.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }

    /// Send `response` to every registered connection.
    ///
    /// # Returns
    /// The connections that were evicted because the write failed.
    ///
    /// # Errors
    /// Only if the response cannot be encoded, in which case nothing is sent.
    pub async fn broadcast(
        &self,
        registry: &mut Registry,
        response: &ServerResponse,
    ) -> Result<Vec<ConnectionId>, RelayError> {
        let text = response.encode()?;
        let mut evicted = Vec::new();

        for id in registry.ids() {
            let Some(connection) = registry.connection_mut(id) else {
                continue;
            };

            let error = match timeout(self.send_timeout, connection.send_text(text.clone())).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => RelayError::Send(format!("write timed out after {:?}", self.send_timeout)),
            };

            warn!(connection = %id, error = %error, "Send failed, evicting connection");
            if let Some(connection) = registry.remove(id) {
                self.retire(connection).await;
            }
            evicted.push(id);
        }

        debug!(
            recipients = registry.len(),
            evicted = evicted.len(),
            "Broadcast delivered"
        );
        Ok(evicted)
    }

    /// Close a connection that has left the registry, bounded by the send timeout.
    pub async fn retire(&self, mut connection: Connection) {
        let id = connection.id();
        if timeout(self.send_timeout, connection.close()).await.is_err() {
            debug!(connection = %id, "Close timed out");
        }
    }
}
