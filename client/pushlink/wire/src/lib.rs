//! Wire grammar for the pushlink streaming protocol.
//!
//! This crate implements both directions of the externally defined text
//! protocol: control requests encoded as ordered `key=value` pairs, and the
//! streaming frame grammar decoded incrementally from the data connection.
//!
//! ## Wire Format
//!
//! ```text
//! control request (one per logical operation, CRLF separated):
//!   LS_op=add&LS_reqId=12&LS_subId=3&LS_group=itemA itemB&...
//!
//! streaming frames (CRLF-terminated lines, leading token = kind):
//!   CONOK,<session id>,<request limit>,<keepalive>,<control link>
//!   SUBOK,<subId>,<num items>,<num fields>
//!   U,<subId>,<item>,<v1>|<v2>|...
//!   PROG,<count>        LOOP,<delay>        END,<code>,<message>
//!   REQOK,<reqId>       REQERR,<reqId>,<code>,<message>
//!   PROBE
//! ```
//!
//! Encoding is deterministic (lexicographic key order, fixed escaping) so
//! encoded requests are byte-stable test fixtures. Decoding is strict: any
//! grammar violation surfaces as a [`ProtocolError`] for the session layer
//! to escalate, and a frame split across I/O boundaries is buffered until
//! complete.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod error;
pub mod frame;
pub mod request;

// Re-export main types
pub use decoder::{FrameDecoder, MAX_LINE_SIZE};
pub use error::ProtocolError;
pub use frame::{end_is_recoverable, unescape, FieldValue, Frame};
pub use request::{escape, ControlRequest, SubscriptionMode};
