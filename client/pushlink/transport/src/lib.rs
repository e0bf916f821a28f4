//! Transport seam for pushlink sessions.
//!
//! This crate defines the narrow contract the session layer programs
//! against: submit a request body, get back a cancellable
//! [`RequestHandle`], and observe per-request [`TransportEvent`] callbacks
//! asynchronously. Two implementations are provided:
//!
//! - [`TcpTransport`]: plain TCP, CRLF-delimited request writes, streamed
//!   reads
//! - [`LoopTransport`]: in-memory, scriptable, for tests
//!
//! Implementations deliver inbound bytes as `Data` events on the streamed
//! connection's token; control-request tokens only ever see `Opened`,
//! `Error`, or `Closed`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod mem;
pub mod tcp;

use bytes::Bytes;
use thiserror::Error;

pub use handle::{CancelSignal, RequestHandle};
pub use mem::LoopTransport;
pub use tcp::TcpTransport;

/// Transport-level errors.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(String),

    /// A control request was submitted with no connection open
    #[error("no connection open")]
    NotConnected,

    /// The request was cancelled through its handle
    #[error("request cancelled")]
    Cancelled,
}

/// Asynchronous per-request callback, correlated by token.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The request was accepted and written to the wire.
    Opened {
        /// Token of the request this event belongs to
        token: u64,
    },
    /// Bytes arrived on a streamed connection.
    Data {
        /// Token of the streamed request
        token: u64,
        /// Raw bytes, possibly a partial frame
        bytes: Bytes,
    },
    /// The connection serving the request closed cleanly.
    Closed {
        /// Token of the request this event belongs to
        token: u64,
    },
    /// The request failed at the transport level.
    Error {
        /// Token of the request this event belongs to
        token: u64,
        /// What went wrong
        error: TransportError,
    },
}

impl TransportEvent {
    /// Token of the request this event is for.
    pub fn token(&self) -> u64 {
        match self {
            TransportEvent::Opened { token }
            | TransportEvent::Data { token, .. }
            | TransportEvent::Closed { token }
            | TransportEvent::Error { token, .. } => *token,
        }
    }
}

/// The transport contract the session layer drives.
///
/// Both methods return immediately; outcomes arrive as [`TransportEvent`]s
/// on the channel the implementation was constructed with.
pub trait Transport: Send + Sync {
    /// Open the data-carrying streamed connection, transmitting `body` as
    /// the opening request.
    fn stream(&self, body: String) -> RequestHandle;

    /// Submit a one-shot control request on the open connection.
    fn send(&self, body: String) -> RequestHandle;
}
