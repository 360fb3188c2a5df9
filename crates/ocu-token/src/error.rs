//! Security token error types.

use thiserror::Error;

/// Errors raised by a security token or the channel to it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token not found: {0}")]
    NotFound(String),

    #[error("token i/o failed: {0}")]
    Io(String),

    #[error("token authentication failed")]
    Authentication,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("card returned status {sw1:02X}{sw2:02X} for {operation}")]
    Card {
        operation: &'static str,
        sw1: u8,
        sw2: u8,
    },

    #[error("invalid result length: expected {expected}, got {got}")]
    InvalidResultLength { expected: usize, got: usize },
}
