//! Per-connection handling: read the request, open an SSE session, stream heartbeats.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::{ServerConfig, SessionConfig};
use crate::error::DaemonError;
use crate::http::{format_error_response, read_request_head};
use crate::metrics;
use crate::shutdown::ConnectionGuard;
use crate::sink::TcpResponseSink;
use crate::streaming::SseSession;

/// Event name of the periodic keep-alive events.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Handles one accepted client connection.
pub struct ConnectionHandler {
    config: ServerConfig,
    session: SessionConfig,
}

impl ConnectionHandler {
    /// Create a handler serving `config.path` with the given session settings.
    pub fn new(config: ServerConfig, session: SessionConfig) -> Self {
        Self { config, session }
    }

    /// Serve a client until it disconnects or the daemon shuts down.
    pub async fn handle(&self, stream: TcpStream, mut guard: ConnectionGuard) {
        let conn_id = guard.id();
        let span = tracing::info_span!("connection", id = conn_id);

        let result = AssertUnwindSafe(self.handle_inner(stream, &mut guard))
            .catch_unwind()
            .instrument(span)
            .await;

        match result {
            Ok(Ok(())) => {
                tracing::debug!(id = conn_id, "Connection completed");
            }
            Ok(Err(e)) => {
                tracing::warn!(id = conn_id, error = %e, "Connection error");
            }
            Err(panic) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(id = conn_id, panic = %panic_msg, "Connection handler panicked");
            }
        }
    }

    async fn handle_inner(&self, mut stream: TcpStream, guard: &mut ConnectionGuard) -> Result<(), DaemonError> {
        let read = tokio::time::timeout(
            self.config.request_timeout(),
            read_request_head(&mut stream, self.config.max_request_head_bytes),
        )
        .await;

        let head = match read {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                reject(&mut stream, e.status(), &e.to_string()).await;
                return Err(e.into());
            }
            Err(_) => {
                reject(&mut stream, 408, "Request head not received in time").await;
                return Err(DaemonError::Timeout("reading request head".to_string()));
            }
        };

        tracing::debug!(method = %head.method, path = %head.path, "Request received");

        if head.method != "GET" {
            reject(&mut stream, 405, &format!("{} not supported", head.method)).await;
            return Ok(());
        }
        if head.path != self.config.path {
            reject(&mut stream, 404, &format!("No event stream at {}", head.path)).await;
            return Ok(());
        }

        self.stream_events(stream, guard).await
    }

    async fn stream_events(&self, stream: TcpStream, guard: &mut ConnectionGuard) -> Result<(), DaemonError> {
        let sink = TcpResponseSink::spawn(stream, self.config.write_timeout());

        let client_gone = Arc::new(Notify::new());
        let notify = client_gone.clone();
        let session = SseSession::builder(sink, guard.connection_id())
            .config(self.session.clone())
            .on_close(move |_sink, id| {
                tracing::info!(%id, "Event stream closed");
                notify.notify_one();
            })
            .open()?;

        tracing::info!(id = %session.connection_id(), "Event stream opened");

        let conn_id = guard.id();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                biased;

                _ = client_gone.notified() => break,

                notice = guard.shutdown_notice() => {
                    tracing::info!(reason = %notice.reason, "Shutdown signaled, closing stream");
                    notice.deliver(&session)?;
                    break;
                }

                _ = heartbeat.tick() => {
                    let payload = json!({ "seq": seq, "connection_id": conn_id });
                    if let Err(e) = session.send_event(&payload.to_string(), HEARTBEAT_EVENT) {
                        tracing::debug!(error = %e, "Heartbeat not sent");
                        break;
                    }
                    seq += 1;
                }
            }
        }

        tracing::info!(events = seq, "Stream completed");
        Ok(())
    }
}

/// Answer with a plain-text error response and close.
async fn reject(stream: &mut TcpStream, status: u16, reason: &str) {
    metrics::record_request_rejected(status);
    let response = format_error_response(status, reason);
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(status, error = %e, "Failed to send error response to client");
    }
    let _ = stream.shutdown().await;
}
