//! Client connections.
//!
//! A [`Connection`] is the write side of one client session together with
//! its identity. The read side is owned by that session's reader task.

pub mod client;
pub mod sink;

pub use client::{Connection, ConnectionId};
pub use sink::OutboundSink;
