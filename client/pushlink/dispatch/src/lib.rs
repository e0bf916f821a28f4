//! Ordered event dispatch for pushlink.
//!
//! Events originate on network tasks but must reach application listeners
//! in decode order, serialized per listener. This crate provides the
//! listener capability traits, the immutable event values, and the
//! [`Dispatcher`] that routes events to per-listener worker tasks.
//!
//! The contract, in short:
//!
//! - enqueueing an event never blocks the posting task
//! - per listener, delivery order equals post order
//! - no two events for one listener execute concurrently
//! - removal drops events not yet delivered; addition sees only later events

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod event;
pub mod listener;

// Re-export main types
pub use dispatcher::{Dispatcher, ListenerKey};
pub use event::{ClientEvent, Event, ItemUpdate, MessageEvent, SubscriptionEvent};
pub use listener::{ClientListener, MessageListener, SubscriptionListener};
