//! SSE framing and sessions.

pub mod frame;
mod session;

pub use session::{CloseCallback, ConnectionId, SessionBuilder, SseSession};
