//! Client SDK for text-based real-time push streaming.
//!
//! pushlink opens and maintains a logical session against a streaming
//! server, multiplexes subscription management and point-to-point
//! messaging over that session, and survives transport interruptions
//! through bind/rebind and recovery cycles while preserving exactly-once,
//! in-order delivery of control outcomes and data updates to application
//! listeners.
//!
//! ## Features
//!
//! - **Session management**: create, automatic rebind, stall detection,
//!   recovery with bounded exponential backoff
//! - **Subscriptions**: item groups with field schemas, snapshots,
//!   differential updates, lost-update accounting
//! - **Messaging**: ordered point-to-point messages with per-message
//!   outcome listeners
//! - **Ordered events**: per-listener serialized delivery in frame-arrival
//!   order, never blocking the network path
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pushlink::{
//!     ClientConfig, ItemUpdate, PushClient, Subscription, SubscriptionListener,
//!     SubscriptionMode,
//! };
//!
//! struct QuoteListener;
//!
//! impl SubscriptionListener for QuoteListener {
//!     fn on_subscribed(&self) {
//!         println!("subscription active");
//!     }
//!
//!     fn on_item_update(&self, update: &ItemUpdate) {
//!         println!(
//!             "{}: bid={:?} ask={:?}",
//!             update.item_name(),
//!             update.value("bid"),
//!             update.value("ask"),
//!         );
//!     }
//! }
//!
//! # fn example() -> Result<(), pushlink::ClientError> {
//! let mut config = ClientConfig::default();
//! config.server_address = "push.example.com:8080".to_string();
//! config.adapter_set = "QUOTES".to_string();
//!
//! let client = PushClient::new(config)?;
//! client.connect()?;
//!
//! let mut subscription = Subscription::new(
//!     SubscriptionMode::Merge,
//!     vec!["itemA".to_string(), "itemB".to_string()],
//!     vec!["bid".to_string(), "ask".to_string()],
//! )?;
//! subscription.add_listener(Arc::new(QuoteListener));
//! let sub_id = client.subscribe(subscription)?;
//!
//! // ... later
//! client.unsubscribe(sub_id)?;
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod subscription;

// Re-export main types
pub use client::PushClient;
pub use config::ClientConfig;
pub use error::ClientError;
pub use subscription::{ClientMessage, Subscription, UNORDERED_SEQUENCE};

// Re-export the listener surface and event values
pub use pushlink_dispatch::{
    ClientListener, ItemUpdate, ListenerKey, MessageListener, SubscriptionListener,
};

// Re-export what custom transports implement
pub use pushlink_transport::{
    LoopTransport, RequestHandle, TcpTransport, Transport, TransportError, TransportEvent,
};

// Re-export wire-level types applications see
pub use pushlink_wire::SubscriptionMode;
