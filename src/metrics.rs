//! Prometheus metrics for SSE sessions and the daemon.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Error reason labels for write failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// Client disconnected (BrokenPipe, ConnectionReset)
    ClientDisconnected,
    Timeout,
    Canceled,
    /// Other network-related errors
    Network,
    Other,
}

impl ErrorReason {
    /// Convert to static string for metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::ClientDisconnected => "client_disconnected",
            ErrorReason::Timeout => "timeout",
            ErrorReason::Canceled => "canceled",
            ErrorReason::Network => "network",
            ErrorReason::Other => "other",
        }
    }

    /// Classify an I/O error into an ErrorReason.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                ErrorReason::ClientDisconnected
            }
            io::ErrorKind::TimedOut => ErrorReason::Timeout,
            io::ErrorKind::Interrupted => ErrorReason::Canceled,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable => ErrorReason::Network,
            _ => ErrorReason::Other,
        }
    }
}

/// Initialize metrics descriptions.
pub fn init_metrics() {
    describe_gauge!(
        "sse_active_connections",
        "Number of currently open client connections"
    );
    describe_counter!(
        "sse_connections_total",
        "Total number of connections accepted"
    );
    describe_counter!(
        "sse_requests_rejected_total",
        "Requests answered with an error status instead of a stream"
    );

    describe_counter!("sse_sessions_opened_total", "SSE sessions opened");
    describe_counter!("sse_sessions_closed_total", "SSE sessions closed");
    describe_histogram!(
        "sse_session_duration_seconds",
        "Time from session open to close"
    );

    describe_counter!("sse_events_sent_total", "Total SSE events sent");
    describe_counter!("sse_bytes_sent_total", "Total bytes sent to clients");
    describe_counter!("sse_write_errors_total", "Client write errors");
}

/// Start the Prometheus metrics HTTP server.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    // Sessions live from seconds to hours: 1s to ~4.5h (base 1, factor 2, count 15)
    let session_buckets: [f64; 15] = [
        1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0,
        16384.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("sse_session_duration_seconds".to_string()),
            &session_buckets,
        )
        .map_err(|e| anyhow::anyhow!("Invalid histogram buckets: {}", e))?
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to start metrics server: {}", e))?;

    tracing::info!(%addr, "Metrics server started");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("sse_connections_total").increment(1);
}

pub fn set_active_connections(count: u64) {
    gauge!("sse_active_connections").set(count as f64);
}

/// Record a request answered with an error status.
pub fn record_request_rejected(status: u16) {
    counter!("sse_requests_rejected_total", "status" => status.to_string()).increment(1);
}

pub fn record_session_opened() {
    counter!("sse_sessions_opened_total").increment(1);
}

/// Record session close with its lifetime.
pub fn record_session_closed(duration: Duration) {
    counter!("sse_sessions_closed_total").increment(1);
    histogram!("sse_session_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_event_sent() {
    counter!("sse_events_sent_total").increment(1);
}

/// Record bytes sent to client.
pub fn record_bytes_sent(bytes: u64) {
    counter!("sse_bytes_sent_total").increment(bytes);
}

/// Record write error with reason label.
pub fn record_write_error(reason: ErrorReason) {
    counter!("sse_write_errors_total", "reason" => reason.as_str()).increment(1);
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
