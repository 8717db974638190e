//! Outbound transports a [`Connection`](super::Connection) can write to.

use crate::error::RelayError;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Write half of a client session.
#[async_trait]
pub trait OutboundSink: Send {
    /// Deliver one encoded frame.
    async fn send_text(&mut self, text: String) -> Result<(), RelayError>;

    /// Shut the transport down.
    async fn close(&mut self) -> Result<(), RelayError>;
}

/// WebSocket write half produced by splitting an accepted stream.
#[async_trait]
impl<S> OutboundSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.send(Message::text(text))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        SinkExt::close(self)
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }
}

/// In-process subscriber. Sends fail once the receiving half is dropped.
#[async_trait]
impl OutboundSink for mpsc::UnboundedSender<String> {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.send(text)
            .map_err(|_| RelayError::Send("receiver dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        Ok(())
    }
}
