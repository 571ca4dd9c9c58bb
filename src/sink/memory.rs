//! In-memory sink that records everything written to it.

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{CloseHook, ResponseSink};
use crate::error::SinkError;

#[derive(Default)]
struct Recorded {
    headers: Vec<(String, String)>,
    status: Option<u16>,
    writes: Vec<Bytes>,
    end_count: usize,
}

/// Sink that keeps headers, status and body writes in memory.
///
/// The close signal is raised by hand with [`RecordingSink::trigger_close`],
/// which may be called any number of times.
#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Recorded>,
    hooks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    fail_writes: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent writes fail with a broken pipe.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fire every registered close listener, in registration order.
    pub fn trigger_close(&self) {
        let hooks: Vec<_> = lock(&self.hooks).clone();
        for hook in hooks {
            hook();
        }
    }

    /// Headers in the order they were set. Setting a name twice replaces the value.
    pub fn headers(&self) -> Vec<(String, String)> {
        lock(&self.recorded).headers.clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.recorded)
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn status(&self) -> Option<u16> {
        lock(&self.recorded).status
    }

    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.recorded).writes.clone()
    }

    /// Body writes decoded as UTF-8 (lossy).
    pub fn written_strings(&self) -> Vec<String> {
        lock(&self.recorded)
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Number of times `end` was called.
    pub fn end_count(&self) -> usize {
        lock(&self.recorded).end_count
    }

    pub fn close_listener_count(&self) -> usize {
        lock(&self.hooks).len()
    }
}

impl ResponseSink for RecordingSink {
    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        let mut recorded = lock(&self.recorded);
        match recorded.headers.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value.to_string(),
            None => recorded.headers.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn set_status(&self, status: u16) -> Result<(), SinkError> {
        lock(&self.recorded).status = Some(status);
        Ok(())
    }

    fn write(&self, chunk: Bytes) -> Result<(), SinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "recording sink write failure").into());
        }
        lock(&self.recorded).writes.push(chunk);
        Ok(())
    }

    fn end(&self) -> Result<(), SinkError> {
        lock(&self.recorded).end_count += 1;
        Ok(())
    }

    fn on_close(&self, hook: CloseHook) {
        lock(&self.hooks).push(Arc::from(hook));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
