//! Per-request cancellation capability.
//!
//! A [`RequestHandle`] is handed back for every submitted request. Closing it
//! raises an explicit cancellation signal that transport tasks observe at
//! their suspension points; no thread ever blocks just to detect
//! cancellation, and closing one handle never affects other requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cancellation signal shared between a handle and the transport task
/// serving its request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    force: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    /// A fresh, un-cancelled signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                force: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Raise the signal. With `force`, the serving task should also tear
    /// down the underlying connection instead of merely going quiet.
    pub fn cancel(&self, force: bool) {
        if force {
            self.inner.force.store(true, Ordering::SeqCst);
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether a forced connection close was requested.
    pub fn force_requested(&self) -> bool {
        self.inner.force.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque cancellation capability for one submitted request.
///
/// The handle does not own the request; it only stops further callbacks for
/// it. Clones share the same underlying signal.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    token: u64,
    signal: CancelSignal,
}

impl RequestHandle {
    /// Create a handle for the given transport token.
    pub fn new(token: u64) -> Self {
        Self {
            token,
            signal: CancelSignal::new(),
        }
    }

    /// Transport-level correlation token for this request.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Stop further callbacks for this request. With
    /// `force_connection_close`, the serving connection is torn down as
    /// well; other requests are unaffected either way.
    pub fn close(&self, force_connection_close: bool) {
        self.signal.cancel(force_connection_close);
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// The underlying cancellation signal, for transport tasks.
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel(false);

        timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let signal = CancelSignal::new();
        signal.cancel(true);

        timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-cancelled signal resolves immediately");
        assert!(signal.force_requested());
    }

    #[test]
    fn test_handle_close_is_shared_across_clones() {
        let handle = RequestHandle::new(7);
        let clone = handle.clone();

        assert!(!clone.is_closed());
        handle.close(false);
        assert!(clone.is_closed());
        assert!(!clone.signal().force_requested());
    }
}
