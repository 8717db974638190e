//! Client connection representation.

use super::sink::OutboundSink;
use crate::error::RelayError;
use crate::protocol::ServerResponse;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An individual client connection.
///
/// Owns the outbound half of the transport. Created by the gateway after a
/// successful upgrade and handed to the dispatcher, which keeps it in the
/// registry until the client leaves or a write to it fails.
///
/// Closing or dropping a connection also stops the reader attached with
/// [`Connection::reader_stop`], so the session ends on both halves.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    sink: Box<dyn OutboundSink>,
    reader_stop: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Wrap an outbound sink as a new connection with a fresh identity.
    pub fn new(remote_addr: SocketAddr, sink: impl OutboundSink + 'static) -> Self {
        Self {
            id: ConnectionId::new(),
            remote_addr,
            connected_at: SystemTime::now(),
            sink: Box::new(sink),
            reader_stop: None,
        }
    }

    /// Signal for the reader of this session. It resolves once the
    /// connection is closed or dropped.
    ///
    /// Only the most recently taken signal is kept; an earlier one resolves
    /// immediately.
    pub fn reader_stop(&mut self) -> oneshot::Receiver<()> {
        let (stop, stopped) = oneshot::channel();
        self.reader_stop = Some(stop);
        stopped
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Encode and send a response.
    pub async fn send(&mut self, response: &ServerResponse) -> Result<(), RelayError> {
        let text = response.encode()?;
        self.send_text(text).await
    }

    /// Send an already encoded frame.
    pub async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.sink.send_text(text).await
    }

    /// Close the transport. Failures are logged and otherwise ignored; the
    /// connection is being discarded either way.
    pub async fn close(&mut self) {
        if let Some(stop) = self.reader_stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.sink.close().await {
            debug!(connection = %self.id, error = %e, "Error while closing connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}
