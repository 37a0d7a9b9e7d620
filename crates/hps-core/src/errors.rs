//! Error types shared across crates.

use thiserror::Error;

/// Errors produced while parsing a timestamp string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseTimestampError {
    /// The input contained no numeric components at all.
    #[error("timestamp \"{0}\" has no digits")]
    NoDigits(String),
    /// The numeric components did not form a valid date or time.
    #[error("invalid timestamp: {0}")]
    ChronoError(String),
}
