//! Session lifecycle, request sequencing, and recovery for pushlink.
//!
//! This crate is the core of the client: a single driver task owns the
//! logical session and everything attached to it.
//!
//! ## Features
//!
//! - **Session state machine**: create, bind/rebind, stall detection,
//!   recovery with bounded exponential backoff, terminal close
//! - **Request manager**: ascending-ID transmission, idempotent
//!   retransmission under the original ID, exactly one terminal outcome per
//!   request, a privileged single-flight bind slot
//! - **Registries**: per-subscription schema and update bookkeeping,
//!   per-message acknowledgment state
//! - **Identifier generator**: strictly increasing request, subscription,
//!   and message counters owned by the client context
//!
//! The driver communicates outward only through the transport seam
//! (`pushlink-transport`) and the event dispatcher (`pushlink-dispatch`);
//! applications talk to it by posting [`Command`]s.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod driver;
pub mod ids;
pub mod registry;
pub mod requests;
pub mod state;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use driver::{Command, SessionConfig, SessionDriver};
pub use ids::IdGenerator;
pub use registry::{MessageRegistry, RegistryError, SubscriptionRegistry, SubscriptionSpec};
pub use requests::{QuietListener, RequestListener, RequestManager};
pub use state::{ConnectionMode, SessionState, SessionStatus};
