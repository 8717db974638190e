//! # Chat Core - Real-Time WebSocket Chat Relay
//!
//! A small relay that accepts WebSocket clients, lets each one announce a
//! username, and fans every chat message out to everyone connected together
//! with the current roster.
//!
//! ## Architecture Overview
//!
//! * **Gateway** - Upgrades `GET {ws_path}`, greets the client, and registers it
//! * **Reader tasks** - One per connection, decoding frames into events
//! * **Event queue** - A bounded channel; readers wait when it is full
//! * **Dispatcher** - The single consumer of the queue and sole owner of the
//!   [`Registry`], so roster state needs no locking
//! * **Broadcaster** - Sends one response to every connection, evicting the
//!   ones whose writes fail or time out
//!
//! ### Message Flow
//!
//! 1. Client sends `{"action": ..., "username": ..., "message": ...}`
//! 2. Its reader decodes the frame and enqueues it tagged with the connection id
//! 3. The dispatcher applies it to the registry in arrival order
//! 4. The resulting response is broadcast to every registered connection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chat_core::{ChatServer, ServerConfig};
//!
//! # async fn run() -> Result<(), chat_core::RelayError> {
//! let config = ServerConfig::new("127.0.0.1:8080".parse().unwrap());
//! config.validate()?;
//! let server = ChatServer::new(config);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Failures are scoped to the connection they concern. A bad frame ends that
//! client's reader, a failed send evicts that client, and a panicking reader
//! is caught by its supervisor. Only [`RelayError::DispatcherClosed`] is fatal
//! to the relay.

pub use broadcast::Broadcaster;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, OutboundSink};
pub use dispatcher::{Command, Dispatcher, RelayHandle, RosterSnapshot};
pub use error::RelayError;
pub use protocol::{
    escape_html, ClientAction, ClientPayload, InboundEvent, ResponseAction, ServerResponse,
    GREETING,
};
pub use registry::{Participant, Registry};
pub use server::{ChatServer, ServerStats};

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
