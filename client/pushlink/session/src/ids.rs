//! Monotonic identifier generation.
//!
//! One generator is owned by each long-lived client context and shared by
//! reference; the counters are never exposed as raw mutable state. Values
//! are strictly increasing and never reused for the lifetime of the
//! generator; at 64 bits, overflow is not an operational concern.

use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing counters for request, subscription, and message
/// identifiers.
#[derive(Debug)]
pub struct IdGenerator {
    next_request: AtomicU64,
    next_subscription: AtomicU64,
    next_message: AtomicU64,
}

impl IdGenerator {
    /// A generator with all counters starting at 1.
    pub fn new() -> Self {
        Self {
            next_request: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            next_message: AtomicU64::new(1),
        }
    }

    /// Allocate the next request id.
    pub fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next subscription id.
    pub fn next_subscription_id(&self) -> u64 {
        self.next_subscription.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next message progressive number.
    pub fn next_message_prog(&self) -> u64 {
        self.next_message.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
