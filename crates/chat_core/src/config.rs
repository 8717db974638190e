//! Relay configuration types and defaults.
//!
//! This module contains the configuration structure used to initialize the
//! chat server: where it listens, which path upgrades to a WebSocket, and the
//! limits that keep one misbehaving client from stalling everyone else.

use crate::error::RelayError;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration settings for the chat server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Network address and port to bind the server to
    pub bind_address: SocketAddr,

    /// Request path that is upgraded to a WebSocket session
    pub ws_path: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Capacity of the event queue feeding the dispatcher.
    /// Readers wait for free capacity when the queue is full.
    pub event_queue_capacity: usize,

    /// Upper bound for a single write to a client, in milliseconds.
    /// A write that takes longer counts as a failed send.
    pub send_timeout_ms: u64,

    /// Seconds a client may stay silent before its connection is dropped.
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,

    /// Treat a dropped connection as if the client had sent `leave`
    pub leave_on_disconnect: bool,
}

impl ServerConfig {
    /// Create a configuration bound to `bind_address` with all other values defaulted.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Set the WebSocket upgrade path
    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the event queue capacity
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the per-send timeout in milliseconds
    pub fn with_send_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.send_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle timeout in seconds (0 disables it)
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// Enable or disable the implicit `leave` on disconnect
    pub fn with_leave_on_disconnect(mut self, enabled: bool) -> Self {
        self.leave_on_disconnect = enabled;
        self
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// Returns `RelayError::Config` describing the first invalid value found
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.ws_path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }

        if self.max_connections == 0 {
            return Err(RelayError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.event_queue_capacity == 0 {
            return Err(RelayError::Config(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.send_timeout_ms == 0 {
            return Err(RelayError::Config(
                "send_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    /// Default values:
    /// - Bind address: 127.0.0.1:8080
    /// - WebSocket path: /ws
    /// - Max connections: 1000
    /// - Event queue capacity: 1024
    /// - Send timeout: 5 seconds
    /// - Idle timeout: disabled
    /// - Leave on disconnect: enabled
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ws_path: "/ws".to_string(),
            max_connections: 1000,
            event_queue_capacity: 1024,
            send_timeout_ms: 5000,
            idle_timeout_secs: 0,
            leave_on_disconnect: true,
        }
    }
}
