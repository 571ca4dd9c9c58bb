//! Connection registry and graceful shutdown for the SSE daemon.
//!
//! Every accepted client is registered with the [`ShutdownCoordinator`], which
//! assigns the connection id that becomes the `id:` field of the client's
//! frames. Shutdown is broadcast as a [`ShutdownNotice`]; each open stream
//! forwards it to its client as a final `shutdown` event before the response
//! is ended, and the daemon then waits for the registry to drain.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::error::SinkError;
use crate::metrics;
use crate::sink::ResponseSink;
use crate::streaming::{ConnectionId, SseSession};

/// Event name of the last event a stream receives when the daemon stops.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// Reason sent to clients when none is given.
pub const DEFAULT_SHUTDOWN_REASON: &str = "server shutting down";

/// Why the daemon is stopping, as told to every open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    pub reason: String,
}

impl ShutdownNotice {
    /// JSON body of the `shutdown` event.
    pub fn payload(&self) -> String {
        json!({ "reason": self.reason }).to_string()
    }

    /// Send the notice as the stream's final event, then end the response.
    ///
    /// A client that is already gone only loses the event; the response is
    /// ended either way.
    pub fn deliver<S: ResponseSink>(&self, session: &SseSession<S>) -> Result<(), SinkError> {
        if let Err(e) = session.send_event(&self.payload(), SHUTDOWN_EVENT) {
            tracing::debug!(id = %session.connection_id(), error = %e, "Shutdown event not sent");
        }
        session.sink().end()
    }
}

/// Shutdown coordinator and registry of open client connections.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Registry>,
}

struct Registry {
    /// `None` while running; the first notice wins.
    notice_tx: watch::Sender<Option<ShutdownNotice>>,
    active: AtomicU64,
    drained: Notify,
    next_id: AtomicU64,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no connections. Ids start at 1.
    pub fn new() -> Self {
        let (notice_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Registry {
                notice_tx,
                active: AtomicU64::new(0),
                drained: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Signal shutdown with the default reason.
    pub fn shutdown(&self) {
        self.shutdown_with_reason(DEFAULT_SHUTDOWN_REASON);
    }

    /// Signal shutdown to all connections. Later calls keep the first reason.
    pub fn shutdown_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let sent = self.inner.notice_tx.send_if_modified(|notice| {
            if notice.is_some() {
                return false;
            }
            *notice = Some(ShutdownNotice { reason: reason.clone() });
            true
        });
        if sent {
            tracing::info!(%reason, active = self.active_connections(), "Shutdown broadcast");
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.inner.notice_tx.borrow().is_some()
    }

    /// The broadcast notice, once shutdown has been signaled.
    pub fn notice(&self) -> Option<ShutdownNotice> {
        self.inner.notice_tx.borrow().clone()
    }

    /// Get a receiver to watch for shutdown.
    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownNotice>> {
        self.inner.notice_tx.subscribe()
    }

    /// Number of registered connections that have not been released.
    pub fn active_connections(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Assign the next connection id and count the connection as active until
    /// the returned guard is dropped.
    pub fn register_connection(&self) -> ConnectionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = self.inner.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_connections(active);

        ConnectionGuard {
            coordinator: self.clone(),
            notices: self.subscribe(),
            id,
        }
    }

    /// Wait until every registered connection has been released.
    pub async fn wait_for_drain(&self) {
        loop {
            // Arm the notification before reading the count so a release in
            // between is not missed.
            let notified = self.inner.drained.notified();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, id: u64) {
        let released = self
            .inner
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        let Ok(previous) = released else {
            tracing::error!(id, "Connection released with no active connections recorded");
            metrics::set_active_connections(0);
            return;
        };

        let remaining = previous - 1;
        metrics::set_active_connections(remaining);
        if remaining == 0 {
            if self.is_shutdown() {
                tracing::debug!(id, "Last connection released during shutdown");
            }
            self.inner.drained.notify_waiters();
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one client connection; releases it on drop.
pub struct ConnectionGuard {
    coordinator: ShutdownCoordinator,
    notices: watch::Receiver<Option<ShutdownNotice>>,
    id: u64,
}

impl ConnectionGuard {
    /// Get the numeric connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The id as it appears in SSE frames.
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::from(self.id)
    }

    /// Wait for the shutdown broadcast.
    ///
    /// Resolves immediately if shutdown was signaled before the call. Cancel
    /// safe, so it can sit in a `select!` loop.
    pub async fn shutdown_notice(&mut self) -> ShutdownNotice {
        loop {
            if let Some(notice) = self.notices.borrow_and_update().clone() {
                return notice;
            }
            if self.notices.changed().await.is_err() {
                // The coordinator outlives its guards, so the sender never goes away.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.coordinator.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use std::time::Duration;

    #[tokio::test]
    async fn test_registration_assigns_ids() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.active_connections(), 0);

        let first = coordinator.register_connection();
        let second = coordinator.register_connection();
        assert_eq!(coordinator.active_connections(), 2);
        assert_eq!(first.id(), 1);
        assert_eq!(second.connection_id(), ConnectionId::Number(2));

        drop(first);
        assert_eq!(coordinator.active_connections(), 1);

        // Ids are never reused.
        let third = coordinator.register_connection();
        assert_eq!(third.id(), 3);

        drop(second);
        drop(third);
        assert_eq!(coordinator.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_first_shutdown_reason_wins() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown());
        assert_eq!(coordinator.notice(), None);

        coordinator.shutdown_with_reason("maintenance");
        coordinator.shutdown();

        assert!(coordinator.is_shutdown());
        assert_eq!(coordinator.notice().unwrap().reason, "maintenance");
    }

    #[tokio::test]
    async fn test_guard_receives_notice() {
        let coordinator = ShutdownCoordinator::new();
        let mut guard = coordinator.register_connection();

        let waiter = tokio::spawn(async move { guard.shutdown_notice().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        coordinator.shutdown();
        let notice = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.reason, DEFAULT_SHUTDOWN_REASON);
    }

    #[tokio::test]
    async fn test_notice_after_shutdown_resolves_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown_with_reason("restart");

        let mut guard = coordinator.register_connection();
        let notice = tokio::time::timeout(Duration::from_millis(100), guard.shutdown_notice())
            .await
            .unwrap();
        assert_eq!(notice.reason, "restart");
    }

    #[test]
    fn test_deliver_sends_final_event_and_ends() {
        let sink = RecordingSink::new();
        let session = SseSession::open(sink.clone(), 9).unwrap();
        let notice = ShutdownNotice {
            reason: "restart".to_string(),
        };

        notice.deliver(&session).unwrap();

        assert_eq!(
            sink.written_strings()[1..],
            [
                "event: shutdown\n",
                "retry: 1000\n",
                "id: 9\n",
                "data: {\"reason\":\"restart\"}\n\n"
            ]
        );
        assert_eq!(sink.end_count(), 1);
    }

    #[test]
    fn test_deliver_ends_even_when_event_fails() {
        let sink = RecordingSink::new();
        let session = SseSession::open(sink.clone(), 9).unwrap();
        sink.set_fail_writes(true);

        ShutdownNotice {
            reason: "restart".to_string(),
        }
        .deliver(&session)
        .unwrap();

        assert_eq!(sink.end_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_drain() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.register_connection();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_drain().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
