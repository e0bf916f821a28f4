//! Immutable event values.
//!
//! One event captures one notification together with everything needed to
//! replay it against any listener. Events are created by the session layer
//! on frame arrival and consumed exactly once by the dispatcher.

/// A resolved item update ready for listener delivery.
///
/// Field values are fully resolved against the previous state of the item:
/// a slot the server omitted carries the prior value, and only genuinely
/// changed fields appear in [`ItemUpdate::changed_fields`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    item_name: String,
    item_pos: u64,
    is_snapshot: bool,
    fields: Vec<(String, Option<String>)>,
    changed: Vec<String>,
}

impl ItemUpdate {
    /// Build an update value; `fields` are in schema order.
    pub fn new(
        item_name: String,
        item_pos: u64,
        is_snapshot: bool,
        fields: Vec<(String, Option<String>)>,
        changed: Vec<String>,
    ) -> Self {
        Self {
            item_name,
            item_pos,
            is_snapshot,
            fields,
            changed,
        }
    }

    /// Name of the item this update is for.
    pub fn item_name(&self) -> &str {
        &self.item_name
    }

    /// 1-based position of the item within the subscribed group.
    pub fn item_pos(&self) -> u64 {
        self.item_pos
    }

    /// Whether this update is part of the initial snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    /// Current value of a field, `None` meaning an explicit null.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_deref())
    }

    /// All fields in schema order with their resolved values.
    pub fn fields(&self) -> &[(String, Option<String>)] {
        &self.fields
    }

    /// Names of the fields that changed in this update.
    pub fn changed_fields(&self) -> &[String] {
        &self.changed
    }

    /// Whether a given field changed in this update.
    pub fn is_changed(&self, field: &str) -> bool {
        self.changed.iter().any(|name| name == field)
    }
}

/// Client-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Session status changed; carries the new status string.
    StatusChange(String),
    /// The server reported a session-level error.
    ServerError {
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// A connection property changed (server name, client ip, ...).
    PropertyChange(String),
}

/// Subscription-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The subscription is active on the server.
    Subscribed,
    /// The subscription was removed.
    Unsubscribed,
    /// A differential item update arrived.
    Update(ItemUpdate),
    /// The server dropped updates for an item.
    LostUpdates {
        /// Item name
        item: String,
        /// How many updates were lost
        lost: u64,
    },
    /// The snapshot for an item is complete.
    EndOfSnapshot {
        /// Item name
        item: String,
    },
    /// The snapshot for an item was invalidated.
    ClearSnapshot {
        /// Item name
        item: String,
    },
    /// The server denied or tore down the subscription.
    Error {
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// The server adjusted the effective update frequency.
    Configuration {
        /// `unlimited` or a frequency in updates per second
        max_frequency: String,
    },
}

/// Message-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// The message was processed by the server.
    Processed,
    /// The server refused the message.
    Denied {
        /// Server error code
        code: i32,
        /// Human-readable cause
        message: String,
    },
    /// The message was aborted before reaching a server outcome.
    Aborted,
}

impl MessageEvent {
    /// Message outcomes are all terminal; delivery retires the listener.
    pub fn is_terminal(&self) -> bool {
        true
    }
}

/// An event addressed to one listener scope.
#[derive(Debug, Clone)]
pub enum Event {
    /// Client-scope notification
    Client(ClientEvent),
    /// Subscription-scope notification
    Subscription {
        /// Target subscription id
        sub_id: u64,
        /// The notification
        event: SubscriptionEvent,
    },
    /// Message-scope notification
    Message {
        /// Target message progressive number
        prog: u64,
        /// The notification
        event: MessageEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_update_accessors() {
        let update = ItemUpdate::new(
            "itemA".to_string(),
            1,
            true,
            vec![
                ("bid".to_string(), Some("101.5".to_string())),
                ("ask".to_string(), None),
            ],
            vec!["bid".to_string()],
        );

        assert_eq!(update.item_name(), "itemA");
        assert_eq!(update.item_pos(), 1);
        assert!(update.is_snapshot());
        assert_eq!(update.value("bid"), Some("101.5"));
        assert_eq!(update.value("ask"), None);
        assert_eq!(update.value("missing"), None);
        assert!(update.is_changed("bid"));
        assert!(!update.is_changed("ask"));
    }
}
