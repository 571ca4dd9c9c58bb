//! TCP listener for SSE clients.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServerConfig;
use crate::error::{DaemonError, Result};
use crate::metrics;
use crate::shutdown::{ConnectionGuard, ShutdownCoordinator};

/// Listener that caps concurrent connections and stops on shutdown.
pub struct SseListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    connection_semaphore: Arc<Semaphore>,
    shutdown: ShutdownCoordinator,
}

impl SseListener {
    /// Bind to `config.listen_addr`.
    ///
    /// Fails with [`DaemonError::Config`] when the settings are unusable.
    pub async fn bind(config: &ServerConfig, shutdown: ShutdownCoordinator) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            DaemonError::Socket(format!("Failed to bind {}: {}", config.listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            %local_addr,
            max_connections = config.max_connections,
            "SSE listener bound"
        );

        Ok(Self {
            listener,
            local_addr,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            shutdown,
        })
    }

    /// Accept the next client.
    ///
    /// Returns None once shutdown has been signaled. At capacity, waits for a
    /// connection to finish. Transient accept errors are logged and retried
    /// after a brief backoff.
    pub async fn accept(&self) -> Option<AcceptedConnection> {
        loop {
            if self.shutdown.is_shutdown() {
                return None;
            }

            let mut shutdown_rx = self.shutdown.subscribe();
            let permit = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return None,
                permit = self.connection_semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return None, // Semaphore closed
                },
            };

            let accept_result = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return None,
                result = self.listener.accept() => result,
            };

            match accept_result {
                Ok((stream, peer_addr)) => {
                    metrics::record_connection_accepted();
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Some(AcceptedConnection {
                        stream,
                        peer_addr,
                        guard: self.shutdown.register_connection(),
                        _permit: permit,
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Address actually bound, with the port resolved when `:0` was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// An accepted client with its capacity permit and connection guard.
pub struct AcceptedConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    /// Registration holding the client's connection id.
    pub guard: ConnectionGuard,
    /// Returned to the listener when the connection is dropped.
    _permit: OwnedSemaphorePermit,
}
