//! Server-Sent Events sessions over an HTTP response sink.
//!
//! [`SseSession`] writes the event-stream headers and the `:ok` handshake,
//! frames events onto any [`ResponseSink`], and runs a close callback when the
//! sink's transport goes away. The `server` module is a small TCP daemon that
//! serves one session per client on top of [`TcpResponseSink`].

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod streaming;

pub use config::{Config, ConfigValue, SessionConfig, SessionOptions};
pub use error::{DaemonError, Result, SinkError};
pub use sink::{RecordingSink, ResponseSink, TcpResponseSink};
pub use streaming::{ConnectionId, SessionBuilder, SseSession};
