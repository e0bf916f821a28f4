//! Wire grammar error types.

use thiserror::Error;

/// Errors raised while decoding streaming frames or encoding requests
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown leading frame tag
    #[error("unknown frame tag: {0}")]
    UnknownTag(String),

    /// Wrong number of tokens for a frame kind
    #[error("{tag}: expected {expected} tokens, got {got}")]
    Arity {
        /// Frame tag being parsed
        tag: &'static str,
        /// Tokens the grammar requires
        expected: usize,
        /// Tokens actually present
        got: usize,
    },

    /// Token failed numeric conversion
    #[error("{tag}: invalid numeric token: {value}")]
    Numeric {
        /// Frame tag being parsed
        tag: &'static str,
        /// Offending token
        value: String,
    },

    /// Malformed percent-escape sequence
    #[error("invalid escape sequence in {0:?}")]
    Escape(String),

    /// Line exceeds the frame size limit
    #[error("frame line exceeds {0} bytes")]
    Oversized(usize),

    /// Frame line is not valid UTF-8
    #[error("frame line is not valid utf-8")]
    Encoding,
}
