//! HTTP/1.1 response sink over a TCP connection.
//!
//! Writes never block the caller: chunks are queued for a writer task that
//! applies a per-write timeout. A reader task watches the socket and raises the
//! close signal when the peer goes away or the response has been ended.
//!
//! An event-stream response has no length; its body ends when the connection
//! closes. A `Content-Length` set on a `text/event-stream` response is kept in
//! the recorded head but never sent, since clients would stop reading once
//! that many bytes arrived.
//!
//! End of input from the client is taken as a disconnect. A client that
//! half-closes its write side after sending the request therefore has its
//! stream closed right after the handshake. Browsers and EventSource clients
//! never do this.

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use super::{CloseHook, ResponseSink};
use crate::error::SinkError;
use crate::http::{format_response_head, header_value};
use crate::metrics::{self, ErrorReason};

enum Outgoing {
    Data(Bytes),
    End,
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    committed: bool,
}

impl ResponseHead {
    /// Headers as they go on the wire.
    fn wire_headers(&self) -> Vec<(String, String)> {
        let event_stream = header_value(&self.headers, "Content-Type")
            .is_some_and(|v| v.trim_start().starts_with("text/event-stream"));
        self.headers
            .iter()
            .filter(|(name, _)| !(event_stream && name.eq_ignore_ascii_case("Content-Length")))
            .cloned()
            .collect()
    }
}

/// Close listeners plus a once-only fired flag.
#[derive(Default)]
struct CloseSignal {
    fired: AtomicBool,
    hooks: Mutex<Vec<CloseHook>>,
}

impl CloseSignal {
    fn register(&self, hook: CloseHook) {
        let mut hooks = lock(&self.hooks);
        if self.fired.load(Ordering::Acquire) {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(hook);
    }

    fn fire(&self) {
        let hooks = {
            let mut hooks = lock(&self.hooks);
            if self.fired.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

/// Response sink writing an HTTP/1.1 response to a TCP client.
///
/// The status line and headers are committed with the first body write (or on
/// `end`), after which header changes fail with [`SinkError::HeadersSent`].
pub struct TcpResponseSink {
    head: Mutex<ResponseHead>,
    tx: mpsc::UnboundedSender<Outgoing>,
    ended: AtomicBool,
    close: Arc<CloseSignal>,
}

impl TcpResponseSink {
    /// Take ownership of `stream` and spawn its writer and close-watcher tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(stream: TcpStream, write_timeout: Duration) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let close = Arc::new(CloseSignal::default());
        let finished = Arc::new(Notify::new());

        tokio::spawn(write_loop(write_half, rx, write_timeout, finished.clone()));
        tokio::spawn(watch_close(read_half, finished, close.clone()));

        Arc::new(Self {
            head: Mutex::new(ResponseHead {
                status: 200,
                headers: Vec::new(),
                committed: false,
            }),
            tx,
            ended: AtomicBool::new(false),
            close,
        })
    }

    /// Whether the peer has gone away or the response was ended.
    pub fn is_closed(&self) -> bool {
        self.close.fired.load(Ordering::Acquire)
    }

    fn enqueue(&self, item: Outgoing) -> Result<(), SinkError> {
        self.tx.send(item).map_err(|_| SinkError::Closed)
    }

    /// Queue the response head if it has not gone out yet. Caller holds the head lock.
    fn commit_head(&self, head: &mut ResponseHead) -> Result<(), SinkError> {
        if !head.committed {
            head.committed = true;
            let headers = head.wire_headers();
            self.enqueue(Outgoing::Data(format_response_head(head.status, &headers)))?;
        }
        Ok(())
    }
}

impl ResponseSink for TcpResponseSink {
    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        let mut head = lock(&self.head);
        if head.committed {
            return Err(SinkError::HeadersSent);
        }
        match head.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.1 = value.to_string(),
            None => head.headers.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn set_status(&self, status: u16) -> Result<(), SinkError> {
        let mut head = lock(&self.head);
        if head.committed {
            return Err(SinkError::HeadersSent);
        }
        head.status = status;
        Ok(())
    }

    fn write(&self, chunk: Bytes) -> Result<(), SinkError> {
        if self.ended.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let mut head = lock(&self.head);
        self.commit_head(&mut head)?;
        self.enqueue(Outgoing::Data(chunk))
    }

    fn end(&self) -> Result<(), SinkError> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut head = lock(&self.head);
        // A writer that already exited has nothing left to flush.
        let _ = self.commit_head(&mut head);
        let _ = self.enqueue(Outgoing::End);
        Ok(())
    }

    fn on_close(&self, hook: CloseHook) {
        self.close.register(hook);
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    write_timeout: Duration,
    finished: Arc<Notify>,
) {
    while let Some(item) = rx.recv().await {
        let data = match item {
            Outgoing::Data(data) => data,
            Outgoing::End => break,
        };

        let result = tokio::time::timeout(write_timeout, stream.write_all(&data))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "Write timeout")));

        match result {
            Ok(()) => metrics::record_bytes_sent(data.len() as u64),
            Err(e) => {
                metrics::record_write_error(ErrorReason::from_io_error(&e));
                tracing::debug!(error = %e, "Client write failed");
                break;
            }
        }
    }

    // Shutdown write side with timeout to avoid hanging on slow/broken clients
    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, stream.shutdown()).await {
        tracing::debug!(error = %e, "Shutdown of client stream failed");
    }
    finished.notify_one();
}

async fn watch_close(mut stream: OwnedReadHalf, finished: Arc<Notify>, close: Arc<CloseSignal>) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = finished.notified() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                // Pipelined bytes from the client are ignored.
                Ok(_) => continue,
            },
        }
    }
    close.fire();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
