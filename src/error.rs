//! Error types for SSE sessions and the streaming daemon.

use std::io;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors reported by a response sink.
///
/// Sessions never catch or retry these; they are handed back to the caller
/// unchanged.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Response already closed")]
    Closed,

    #[error("Headers already sent")]
    HeadersSent,
}

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Bad request: {0}")]
    Request(#[from] RequestError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Errors while reading the HTTP request head from a client.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed before request head was complete")]
    Incomplete,

    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("Read error: {0}")]
    Read(#[from] io::Error),
}

impl RequestError {
    /// HTTP status the daemon answers with for this error.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::TooLarge(_) => 431,
            _ => 400,
        }
    }
}
