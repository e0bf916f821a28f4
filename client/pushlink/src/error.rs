//! Facade error types.

use thiserror::Error;

/// Errors surfaced synchronously by facade calls, before any network
/// interaction.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration or call arguments
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Call not valid in the client's current state
    #[error("illegal state: {0}")]
    IllegalState(String),
}
