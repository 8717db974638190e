//! Error types for the chat relay core.

use thiserror::Error;

/// Errors produced by the relay core.
///
/// None of these are retried. A failure is terminal for the connection it
/// concerns and never for the relay as a whole, with the exception of
/// [`RelayError::DispatcherClosed`], which means the single consumer of the
/// event queue is gone.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dispatcher is no longer running")]
    DispatcherClosed,
}
