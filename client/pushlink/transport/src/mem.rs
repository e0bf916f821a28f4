//! In-memory loop transport.
//!
//! Records every transmitted body and lets a test script the server side:
//! pushing frame lines, dropping the streamed connection, or failing control
//! writes. Behaves like a single-connection transport, so drivers exercise
//! the same code paths as over TCP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::handle::{CancelSignal, RequestHandle};
use crate::{Transport, TransportError, TransportEvent};

#[derive(Default)]
struct LoopState {
    sent: Vec<String>,
    stream: Option<(u64, CancelSignal)>,
    fail_sends: u32,
    offline: bool,
}

/// Scriptable in-memory transport for tests.
pub struct LoopTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    next_token: AtomicU64,
    state: Mutex<LoopState>,
}

impl LoopTransport {
    /// Transport reporting events on `events`.
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            next_token: AtomicU64::new(1),
            state: Mutex::new(LoopState::default()),
        }
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().expect("loop state lock poisoned")
    }

    /// All bodies transmitted so far, in wire order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Deliver one frame line (CRLF appended) on the streamed connection.
    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{}\r\n", line).as_bytes());
    }

    /// Deliver raw bytes on the streamed connection, for split-frame tests.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let state = self.lock();
        if let Some((token, signal)) = state.stream.as_ref() {
            if !signal.is_cancelled() {
                self.events
                    .send(TransportEvent::Data {
                        token: *token,
                        bytes: Bytes::copy_from_slice(bytes),
                    })
                    .ok();
            }
        }
    }

    /// Simulate the server dropping the streamed connection.
    pub fn drop_stream(&self) {
        let mut state = self.lock();
        if let Some((token, signal)) = state.stream.take() {
            if !signal.is_cancelled() {
                self.events.send(TransportEvent::Closed { token }).ok();
            }
        }
    }

    /// Fail the next `n` control writes with a transport error.
    pub fn fail_next_sends(&self, n: u32) {
        self.lock().fail_sends = n;
    }

    /// Refuse all traffic until a new streamed connection is opened.
    pub fn go_offline(&self) {
        let mut state = self.lock();
        state.offline = true;
        if let Some((token, signal)) = state.stream.take() {
            if !signal.is_cancelled() {
                self.events.send(TransportEvent::Closed { token }).ok();
            }
        }
    }

    /// Token of the current streamed connection, if one is open.
    pub fn stream_token(&self) -> Option<u64> {
        self.lock().stream.as_ref().map(|(token, _)| *token)
    }
}

impl Transport for LoopTransport {
    fn stream(&self, body: String) -> RequestHandle {
        let token = self.next_token();
        let handle = RequestHandle::new(token);

        let mut state = self.lock();
        state.offline = false;
        state.sent.push(body);
        state.stream = Some((token, handle.signal().clone()));
        debug!("loop transport: stream {} open", token);

        self.events.send(TransportEvent::Opened { token }).ok();
        handle
    }

    fn send(&self, body: String) -> RequestHandle {
        let token = self.next_token();
        let handle = RequestHandle::new(token);

        let mut state = self.lock();
        if state.offline || state.fail_sends > 0 {
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
            }
            debug!("loop transport: failing control write {}", token);
            self.events
                .send(TransportEvent::Error {
                    token,
                    error: TransportError::NotConnected,
                })
                .ok();
        } else {
            state.sent.push(body);
            self.events.send(TransportEvent::Opened { token }).ok();
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_bodies_in_wire_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LoopTransport::new(tx);

        transport.stream("create".to_string());
        transport.send("first".to_string());
        transport.send("second".to_string());

        assert_eq!(transport.sent(), vec!["create", "first", "second"]);
        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(TransportEvent::Opened { .. })));
        }
    }

    #[tokio::test]
    async fn test_failure_injection_and_recovery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LoopTransport::new(tx);
        transport.stream("create".to_string());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Opened { .. })));

        transport.fail_next_sends(1);
        transport.send("doomed".to_string());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error { .. })));

        transport.send("fine".to_string());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Opened { .. })));
        assert_eq!(transport.sent(), vec!["create", "fine"]);
    }

    #[tokio::test]
    async fn test_cancelled_stream_stops_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LoopTransport::new(tx);
        let handle = transport.stream("create".to_string());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Opened { .. })));

        handle.close(false);
        transport.push_line("PROBE");
        assert!(rx.try_recv().is_err(), "no data after handle close");
    }
}
