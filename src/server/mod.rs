//! TCP server that serves one SSE session per client.

mod connection;
mod listener;

pub use connection::{ConnectionHandler, HEARTBEAT_EVENT};
pub use listener::{AcceptedConnection, SseListener};
