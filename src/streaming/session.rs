//! SSE session: open handshake, framed sends, and close handling.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::frame;
use crate::config::{SessionConfig, SessionOptions};
use crate::error::SinkError;
use crate::metrics::{self, Timer};
use crate::sink::ResponseSink;

/// Opaque identifier of a client connection, echoed in every frame's `id:` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionId::Number(n) => write!(f, "{}", n),
            ConnectionId::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! connection_id_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ConnectionId {
                fn from(n: $t) -> Self {
                    ConnectionId::Number(i64::from(n))
                }
            }
        )*
    };
}

connection_id_from_int!(i32, i64, u16, u32);

impl From<u64> for ConnectionId {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => ConnectionId::Number(n),
            Err(_) => ConnectionId::Text(n.to_string()),
        }
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        ConnectionId::Text(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        ConnectionId::Text(s)
    }
}

/// Callback run when the sink's channel closes, before the sink is ended.
pub type CloseCallback<S> = Box<dyn Fn(&S, &ConnectionId) + Send + Sync>;

/// An open SSE response bound to one sink and one connection id.
///
/// The `retry:` and `id:` fragments are built once at open and every send
/// writes those same buffers.
pub struct SseSession<S: ResponseSink> {
    sink: Arc<S>,
    connection_id: ConnectionId,
    retry: Bytes,
    id: Bytes,
    closed: Arc<AtomicBool>,
}

impl<S: ResponseSink> SseSession<S> {
    /// Open with default configuration and no close callback.
    pub fn open(sink: Arc<S>, connection_id: impl Into<ConnectionId>) -> Result<Self, SinkError> {
        Self::builder(sink, connection_id).open()
    }

    pub fn builder(sink: Arc<S>, connection_id: impl Into<ConnectionId>) -> SessionBuilder<S> {
        SessionBuilder {
            sink,
            connection_id: connection_id.into(),
            config: SessionConfig::default(),
            on_close: None,
        }
    }

    /// Send `data` as a `message` event.
    pub fn send(&self, data: &str) -> Result<(), SinkError> {
        self.send_event(data, frame::DEFAULT_EVENT_TYPE)
    }

    /// Send `data` under the given event name.
    ///
    /// Writes four separate chunks: event, retry, id, data.
    pub fn send_event(&self, data: &str, event_type: &str) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }

        self.sink.write(frame::event_fragment(event_type))?;
        self.sink.write(self.retry.clone())?;
        self.sink.write(self.id.clone())?;
        self.sink.write(frame::data_fragment(data))?;

        metrics::record_event_sent();
        Ok(())
    }

    /// Whether the close signal has been handled.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    pub fn retry_fragment(&self) -> &Bytes {
        &self.retry
    }

    pub fn id_fragment(&self) -> &Bytes {
        &self.id
    }
}

impl<S: ResponseSink> fmt::Debug for SseSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseSession")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Collects configuration and the close callback before opening a session.
pub struct SessionBuilder<S: ResponseSink> {
    sink: Arc<S>,
    connection_id: ConnectionId,
    config: SessionConfig,
    on_close: Option<CloseCallback<S>>,
}

impl<S: ResponseSink> SessionBuilder<S> {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Overlay caller options on the defaults.
    pub fn options(mut self, options: &SessionOptions) -> Self {
        self.config = options.resolve();
        self
    }

    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&S, &ConnectionId) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Register the close hook, write headers and status, then the acknowledgment.
    ///
    /// If the handshake fails the hook stays registered but is disarmed: a
    /// later close signal neither runs the callback nor ends the sink.
    pub fn open(self) -> Result<SseSession<S>, SinkError> {
        let SessionBuilder {
            sink,
            connection_id,
            config,
            on_close,
        } = self;

        let retry = frame::retry_fragment(&config.retry);
        let id = frame::id_fragment(&connection_id);
        let closed = Arc::new(AtomicBool::new(false));

        sink.on_close(close_hook(
            Arc::downgrade(&sink),
            connection_id.clone(),
            closed.clone(),
            on_close,
        ));

        if let Err(e) = handshake(sink.as_ref(), &config) {
            closed.store(true, Ordering::Release);
            tracing::debug!(id = %connection_id, error = %e, "SSE handshake failed");
            return Err(e);
        }

        metrics::record_session_opened();
        tracing::debug!(id = %connection_id, retry = %config.retry, "SSE session opened");

        Ok(SseSession {
            sink,
            connection_id,
            retry,
            id,
            closed,
        })
    }
}

fn handshake<S: ResponseSink>(sink: &S, config: &SessionConfig) -> Result<(), SinkError> {
    for (name, value) in frame::SSE_HEADERS {
        sink.set_header(name, value)?;
    }
    sink.set_header(
        frame::CONTENT_LENGTH,
        &config.max_event_source_buffer_size.to_string(),
    )?;
    sink.set_status(frame::SSE_STATUS)?;
    sink.write(frame::ack())
}

/// Build the listener that runs the callback and ends the sink. A repeated
/// close signal is ignored.
///
/// The sink owns this listener, so it only holds a weak reference back.
fn close_hook<S: ResponseSink>(
    sink: Weak<S>,
    connection_id: ConnectionId,
    closed: Arc<AtomicBool>,
    on_close: Option<CloseCallback<S>>,
) -> Box<dyn Fn() + Send + Sync> {
    let timer = Timer::new();
    Box::new(move || {
        if closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(id = %connection_id, "Ignoring close signal");
            return;
        }
        let Some(sink) = sink.upgrade() else {
            // Session and every other handle already dropped.
            metrics::record_session_closed(timer.elapsed());
            return;
        };

        if let Some(callback) = &on_close {
            callback(sink.as_ref(), &connection_id);
        }
        if let Err(e) = sink.end() {
            tracing::warn!(id = %connection_id, error = %e, "Failed to end response");
        }

        metrics::record_session_closed(timer.elapsed());
        tracing::debug!(id = %connection_id, "SSE session closed");
    })
}
