//! Listener capability traits.
//!
//! Each trait models one notification surface with one method per
//! notification kind; every method has a no-op default so applications
//! implement only what they care about. Implementations must be cheap and
//! non-blocking: they run on the listener's dedicated delivery context, and
//! a slow callback delays only that listener, never the network path.

use crate::event::ItemUpdate;

/// Notifications about the client's session as a whole.
pub trait ClientListener: Send + Sync {
    /// The session status changed.
    fn on_status_change(&self, _status: &str) {}

    /// The server reported a session-level error; always followed by a
    /// final status change.
    fn on_server_error(&self, _code: i32, _message: &str) {}

    /// A connection property changed (server name, client ip, ...).
    fn on_property_change(&self, _property: &str) {}

    /// This listener was attached to a client.
    fn on_listen_start(&self) {}

    /// This listener was detached from a client.
    fn on_listen_end(&self) {}
}

/// Notifications about one subscription.
pub trait SubscriptionListener: Send + Sync {
    /// The subscription is active on the server.
    fn on_subscribed(&self) {}

    /// The subscription was removed, by request or session end.
    fn on_unsubscribed(&self) {}

    /// A differential update arrived for one item.
    fn on_item_update(&self, _update: &ItemUpdate) {}

    /// The server dropped `lost` updates for an item.
    fn on_item_lost_updates(&self, _item: &str, _lost: u64) {}

    /// The initial snapshot for an item is complete.
    fn on_end_of_snapshot(&self, _item: &str) {}

    /// The snapshot for an item was invalidated; a fresh one follows.
    fn on_clear_snapshot(&self, _item: &str) {}

    /// The server denied or tore down the subscription.
    fn on_subscription_error(&self, _code: i32, _message: &str) {}

    /// The server adjusted the effective update frequency.
    fn on_configuration(&self, _max_frequency: &str) {}
}

/// Notifications about one submitted message.
pub trait MessageListener: Send + Sync {
    /// The server processed the message.
    fn on_processed(&self) {}

    /// The server refused the message.
    fn on_denied(&self, _code: i32, _message: &str) {}

    /// The message was aborted before reaching a server outcome.
    fn on_abort(&self) {}
}
