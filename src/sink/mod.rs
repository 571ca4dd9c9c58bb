//! Response sinks: the output side of an HTTP response that SSE frames are written to.

mod memory;
mod tcp;

pub use memory::RecordingSink;
pub use tcp::TcpResponseSink;

use bytes::Bytes;

use crate::error::SinkError;

/// Listener invoked when the sink's underlying channel closes.
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Capability contract a response stream offers to an SSE session.
///
/// Methods take `&self` so a sink can be shared between the session and the
/// close listeners it holds. Implementations decide how headers reach the wire
/// and how transport closure is detected.
pub trait ResponseSink: Send + Sync + 'static {
    /// Set a response header. Fails once headers have been committed.
    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError>;

    /// Set the response status code.
    fn set_status(&self, status: u16) -> Result<(), SinkError>;

    /// Append a chunk to the response body. Each call is one discrete write.
    fn write(&self, chunk: Bytes) -> Result<(), SinkError>;

    /// Terminate the response.
    fn end(&self) -> Result<(), SinkError>;

    /// Register a listener for the underlying channel closing.
    fn on_close(&self, hook: CloseHook);
}
