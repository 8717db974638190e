//! Network side of the relay: accept loop, upgrade gateway, and the
//! supervised per-connection readers.

mod core;
mod gateway;
mod reader;

pub use self::core::{ChatServer, ServerStats};
