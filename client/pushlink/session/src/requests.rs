//! Control-request sequencing and retry.
//!
//! The manager owns the table of pending control requests. Request IDs are
//! assigned here, once, at submission; the table is a `BTreeMap` so
//! transmission always walks pending requests in ascending-ID order. A
//! transport-level delivery failure schedules a retransmission of the same
//! encoded body under the same ID, bounded by the retry policy and the
//! per-request deadline. Every request reaches exactly one terminal
//! callback: processed, denied, or aborted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use pushlink_transport::RequestHandle;

use crate::backoff::BackoffPolicy;
use crate::ids::IdGenerator;

/// Terminal-outcome callbacks for one control request.
///
/// Exactly one of these fires per submitted request, never more.
pub trait RequestListener: Send + Sync {
    /// The server acknowledged the request.
    fn on_processed(&self, _req_id: u64) {}

    /// The server explicitly denied the request; never retried.
    fn on_denied(&self, _req_id: u64, _code: i32, _message: &str) {}

    /// The request was abandoned: retry budget exhausted, deadline passed,
    /// superseded, or the session closed.
    fn on_aborted(&self, _req_id: u64) {}
}

/// Listener for requests whose outcomes are observed elsewhere.
pub struct QuietListener;

impl RequestListener for QuietListener {
    fn on_denied(&self, req_id: u64, code: i32, message: &str) {
        warn!("request {} denied: {} {}", req_id, code, message);
    }
}

enum Terminal {
    Processed,
    Denied(i32, String),
    Aborted,
}

struct PendingRequest {
    body: String,
    listener: Arc<dyn RequestListener>,
    attempts: u32,
    deadline: Instant,
    on_wire: Option<u64>,
    retry_at: Option<Instant>,
    handle: Option<RequestHandle>,
}

struct BindSlot {
    req_id: u64,
    listener: Arc<dyn RequestListener>,
    handle: Option<RequestHandle>,
}

#[derive(Default)]
struct Inner {
    pending: BTreeMap<u64, PendingRequest>,
    bind: Option<BindSlot>,
    closed: bool,
}

/// Owns in-flight and queued control requests for one session.
pub struct RequestManager {
    inner: Mutex<Inner>,
    policy: BackoffPolicy,
    request_timeout: Duration,
    ids: Arc<IdGenerator>,
}

impl RequestManager {
    /// Manager drawing request IDs from `ids`, retrying per `policy`, with
    /// a per-request time budget of `request_timeout`.
    pub fn new(ids: Arc<IdGenerator>, policy: BackoffPolicy, request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
            request_timeout,
            ids,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("request table lock poisoned")
    }

    /// Queue a request. `build` receives the freshly assigned request ID
    /// and returns the encoded body, which is cached for retransmission.
    ///
    /// If the session is already closed the request is aborted immediately;
    /// either way the assigned ID is returned.
    pub fn submit<F>(&self, build: F, listener: Arc<dyn RequestListener>) -> u64
    where
        F: FnOnce(u64) -> String,
    {
        let req_id = self.ids.next_request_id();
        let body = build(req_id);

        let rejected = {
            let mut inner = self.lock();
            if inner.closed {
                true
            } else {
                inner.pending.insert(
                    req_id,
                    PendingRequest {
                        body,
                        listener: Arc::clone(&listener),
                        attempts: 0,
                        deadline: Instant::now() + self.request_timeout,
                        on_wire: None,
                        retry_at: None,
                        handle: None,
                    },
                );
                false
            }
        };

        if rejected {
            debug!("request {} submitted after close, aborting", req_id);
            listener.on_aborted(req_id);
        }
        req_id
    }

    /// Requests ready for (re)transmission, in ascending-ID order.
    pub fn transmittable(&self, now: Instant) -> Vec<(u64, String)> {
        let inner = self.lock();
        if inner.closed {
            return Vec::new();
        }
        inner
            .pending
            .iter()
            .filter(|(_, req)| {
                req.on_wire.is_none() && req.retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|(id, req)| (*id, req.body.clone()))
            .collect()
    }

    /// Record that an attempt for `req_id` went on the wire under the given
    /// transport token.
    pub fn mark_on_wire(&self, req_id: u64, token: u64, handle: RequestHandle) {
        let mut inner = self.lock();
        if let Some(req) = inner.pending.get_mut(&req_id) {
            req.on_wire = Some(token);
            req.retry_at = None;
            req.attempts += 1;
            req.handle = Some(handle);
        }
    }

    /// Record a transport-level failure for the attempt carried by `token`.
    ///
    /// Returns the retransmission time, or `None` when the request was
    /// aborted (budget or deadline exhausted) or the token is unknown.
    pub fn attempt_failed(&self, token: u64, now: Instant) -> Option<Instant> {
        let (retry_at, fired) = {
            let mut inner = self.lock();
            let req_id = inner
                .pending
                .iter()
                .find(|(_, req)| req.on_wire == Some(token))
                .map(|(id, _)| *id)?;

            let req = inner.pending.get_mut(&req_id).expect("entry just found");
            req.on_wire = None;
            req.handle = None;

            if !self.policy.allows_another(req.attempts) || now >= req.deadline {
                let req = inner.pending.remove(&req_id).expect("entry just found");
                warn!(
                    "request {} abandoned after {} attempts",
                    req_id, req.attempts
                );
                (None, Some((req_id, req.listener, Terminal::Aborted)))
            } else {
                let at = now + self.policy.delay_for_attempt(req.attempts);
                debug!(
                    "request {} attempt {} failed, retrying at {:?}",
                    req_id, req.attempts, at
                );
                req.retry_at = Some(at);
                (Some(at), None)
            }
        };

        if let Some((req_id, listener, terminal)) = fired {
            fire(req_id, &listener, terminal);
        }
        retry_at
    }

    /// Return in-flight requests to the queue for immediate retransmission
    /// on a fresh connection; their IDs and bodies are reused verbatim.
    pub fn requeue_in_flight(&self) {
        let mut inner = self.lock();
        for req in inner.pending.values_mut() {
            if req.on_wire.take().is_some() {
                req.handle = None;
                req.retry_at = None;
            }
        }
    }

    /// Server acknowledged a request. Returns whether the ID was pending.
    pub fn complete_processed(&self, req_id: u64) -> bool {
        let fired = {
            let mut inner = self.lock();
            inner
                .pending
                .remove(&req_id)
                .map(|req| (req.listener, Terminal::Processed))
        };
        match fired {
            Some((listener, terminal)) => {
                fire(req_id, &listener, terminal);
                true
            }
            None => false,
        }
    }

    /// Server denied a request. Returns whether the ID was pending.
    pub fn complete_denied(&self, req_id: u64, code: i32, message: &str) -> bool {
        let fired = {
            let mut inner = self.lock();
            inner
                .pending
                .remove(&req_id)
                .map(|req| (req.listener, Terminal::Denied(code, message.to_string())))
        };
        match fired {
            Some((listener, terminal)) => {
                fire(req_id, &listener, terminal);
                true
            }
            None => false,
        }
    }

    /// Open the privileged bind slot. At most one bind is ever in flight: a
    /// pending one is cancelled (forced) and aborted before the new bind is
    /// admitted. Returns the new bind's ID and encoded body.
    pub fn begin_bind<F>(&self, build: F, listener: Arc<dyn RequestListener>) -> (u64, String)
    where
        F: FnOnce(u64) -> String,
    {
        let req_id = self.ids.next_request_id();
        let body = build(req_id);

        let superseded = {
            let mut inner = self.lock();
            if inner.closed {
                drop(inner);
                fire(req_id, &listener, Terminal::Aborted);
                return (req_id, body);
            }
            let superseded = inner.bind.take();
            inner.bind = Some(BindSlot {
                req_id,
                listener,
                handle: None,
            });
            superseded
        };

        if let Some(old) = superseded {
            debug!("bind {} superseded by bind {}", old.req_id, req_id);
            if let Some(handle) = old.handle {
                handle.close(true);
            }
            fire(old.req_id, &old.listener, Terminal::Aborted);
        }

        (req_id, body)
    }

    /// Attach the transport handle serving the current bind.
    pub fn attach_bind_handle(&self, handle: RequestHandle) {
        let mut inner = self.lock();
        if let Some(slot) = inner.bind.as_mut() {
            slot.handle = Some(handle);
        }
    }

    /// Whether `req_id` is the bind currently in flight.
    pub fn is_bind(&self, req_id: u64) -> bool {
        self.lock()
            .bind
            .as_ref()
            .map(|slot| slot.req_id == req_id)
            .unwrap_or(false)
    }

    /// The bind succeeded (session frame observed).
    pub fn bind_succeeded(&self) {
        let slot = self.lock().bind.take();
        if let Some(slot) = slot {
            fire(slot.req_id, &slot.listener, Terminal::Processed);
        }
    }

    /// The bind was denied by the server.
    pub fn bind_denied(&self, code: i32, message: &str) {
        let slot = self.lock().bind.take();
        if let Some(slot) = slot {
            fire(
                slot.req_id,
                &slot.listener,
                Terminal::Denied(code, message.to_string()),
            );
        }
    }

    /// Close the table: cancel every pending handle and deliver exactly one
    /// abort per still-pending request. Later submissions abort on entry.
    pub fn abort_all(&self) {
        let (pending, bind) = {
            let mut inner = self.lock();
            inner.closed = true;
            let pending: Vec<_> = std::mem::take(&mut inner.pending).into_iter().collect();
            (pending, inner.bind.take())
        };

        for (req_id, req) in pending {
            if let Some(handle) = req.handle {
                handle.close(false);
            }
            fire(req_id, &req.listener, Terminal::Aborted);
        }
        if let Some(slot) = bind {
            if let Some(handle) = slot.handle {
                handle.close(true);
            }
            fire(slot.req_id, &slot.listener, Terminal::Aborted);
        }
    }

    /// Earliest scheduled retransmission, for the driver's retry timer.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.lock()
            .pending
            .values()
            .filter(|req| req.on_wire.is_none())
            .filter_map(|req| req.retry_at)
            .min()
    }

    /// Number of requests without a terminal outcome yet.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether the table has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn fire(req_id: u64, listener: &Arc<dyn RequestListener>, terminal: Terminal) {
    match terminal {
        Terminal::Processed => listener.on_processed(req_id),
        Terminal::Denied(code, message) => listener.on_denied(req_id, code, &message),
        Terminal::Aborted => listener.on_aborted(req_id),
    }
}
