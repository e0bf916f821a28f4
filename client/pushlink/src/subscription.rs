//! Subscription and message values built by applications.

use std::sync::Arc;

use pushlink_dispatch::{MessageListener, SubscriptionListener};
use pushlink_session::SubscriptionSpec;
use pushlink_wire::SubscriptionMode;

use crate::error::ClientError;

/// Default ordering sequence for messages submitted without one.
pub const UNORDERED_SEQUENCE: &str = "UNORDERED";

fn check_token(kind: &str, value: &str) -> Result<(), ClientError> {
    if value.is_empty() {
        return Err(ClientError::Configuration(format!(
            "{} name must not be empty",
            kind
        )));
    }
    if value.contains([' ', ',', '|', '&', '=']) {
        return Err(ClientError::Configuration(format!(
            "{} name {:?} contains a reserved character",
            kind, value
        )));
    }
    Ok(())
}

/// A subscription request: item group, field schema, delivery mode, and the
/// listeners to notify. Owned by the facade; the rest of the client refers
/// to it only by the id assigned at subscribe time.
pub struct Subscription {
    mode: SubscriptionMode,
    items: Vec<String>,
    fields: Vec<String>,
    snapshot: bool,
    listeners: Vec<Arc<dyn SubscriptionListener>>,
}

impl Subscription {
    /// Build a subscription; fails synchronously on an empty item group,
    /// empty schema, or wire-unsafe names.
    pub fn new(
        mode: SubscriptionMode,
        items: Vec<String>,
        fields: Vec<String>,
    ) -> Result<Self, ClientError> {
        if items.is_empty() {
            return Err(ClientError::Configuration(
                "subscription needs at least one item".to_string(),
            ));
        }
        if fields.is_empty() {
            return Err(ClientError::Configuration(
                "subscription needs at least one field".to_string(),
            ));
        }
        for item in &items {
            check_token("item", item)?;
        }
        for field in &fields {
            check_token("field", field)?;
        }
        Ok(Self {
            mode,
            items,
            fields,
            snapshot: true,
            listeners: Vec::new(),
        })
    }

    /// Whether to request the initial snapshot (on by default).
    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Attach a listener; it observes this subscription's events once the
    /// subscription is submitted.
    pub fn add_listener(&mut self, listener: Arc<dyn SubscriptionListener>) {
        self.listeners.push(listener);
    }

    /// Item group, in position order.
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Field schema, in position order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Delivery mode.
    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub(crate) fn into_parts(self) -> (SubscriptionSpec, Vec<Arc<dyn SubscriptionListener>>) {
        let spec = SubscriptionSpec {
            items: self.items,
            fields: self.fields,
            mode: self.mode,
            snapshot: self.snapshot,
        };
        (spec, self.listeners)
    }
}

/// A point-to-point message bound for the server.
pub struct ClientMessage {
    text: String,
    sequence: String,
    needs_ack: bool,
    listeners: Vec<Arc<dyn MessageListener>>,
}

impl ClientMessage {
    /// Build a message; fails synchronously on an empty payload.
    pub fn new(text: impl Into<String>) -> Result<Self, ClientError> {
        let text = text.into();
        if text.is_empty() {
            return Err(ClientError::Configuration(
                "message text must not be empty".to_string(),
            ));
        }
        Ok(Self {
            text,
            sequence: UNORDERED_SEQUENCE.to_string(),
            needs_ack: false,
            listeners: Vec::new(),
        })
    }

    /// Deliver in order within the named sequence.
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Result<Self, ClientError> {
        let sequence = sequence.into();
        check_token("sequence", &sequence)?;
        self.sequence = sequence;
        Ok(self)
    }

    /// Ask the server for an explicit processing acknowledgment.
    pub fn with_ack(mut self, needs_ack: bool) -> Self {
        self.needs_ack = needs_ack;
        self
    }

    /// Attach a listener for this message's outcome.
    pub fn add_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn into_parts(self) -> (String, String, bool, Vec<Arc<dyn MessageListener>>) {
        (self.text, self.sequence, self.needs_ack, self.listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_validates_synchronously() {
        assert!(Subscription::new(
            SubscriptionMode::Merge,
            vec![],
            vec!["bid".to_string()]
        )
        .is_err());

        assert!(Subscription::new(
            SubscriptionMode::Merge,
            vec!["itemA".to_string()],
            vec![]
        )
        .is_err());

        assert!(Subscription::new(
            SubscriptionMode::Merge,
            vec!["item A".to_string()],
            vec!["bid".to_string()]
        )
        .is_err());

        let sub = Subscription::new(
            SubscriptionMode::Distinct,
            vec!["itemA".to_string()],
            vec!["bid".to_string(), "ask".to_string()],
        )
        .unwrap();
        assert_eq!(sub.items(), ["itemA"]);
        assert_eq!(sub.mode(), SubscriptionMode::Distinct);
    }

    #[test]
    fn test_message_validates_synchronously() {
        assert!(ClientMessage::new("").is_err());

        let msg = ClientMessage::new("hello").unwrap();
        assert!(msg.with_sequence("bad seq").is_err());

        let msg = ClientMessage::new("hello")
            .unwrap()
            .with_sequence("orders")
            .unwrap()
            .with_ack(true);
        let (text, sequence, needs_ack, _) = msg.into_parts();
        assert_eq!(text, "hello");
        assert_eq!(sequence, "orders");
        assert!(needs_ack);
    }
}
