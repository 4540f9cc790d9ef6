use std::ops::Range;

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the replicated log layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Core is not writable: {key}")]
    NotWritable { key: String },

    #[error("Timed out waiting for blocks {start}..{end}")]
    Timeout { start: u64, end: u64 },

    #[error("No peers replicating blocks {start}..{end}")]
    NoPeers { start: u64, end: u64 },

    #[error("Core has been closed")]
    Closed,

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl CoreError {
    /// Create a not writable error for the given key
    pub fn not_writable<S: Into<String>>(key: S) -> Self {
        Self::NotWritable { key: key.into() }
    }

    /// Create a timeout error covering a block range
    pub fn timeout(range: &Range<u64>) -> Self {
        Self::Timeout {
            start: range.start,
            end: range.end,
        }
    }

    /// Create an error for a range no connected peer can supply
    pub fn no_peers(range: &Range<u64>) -> Self {
        Self::NoPeers {
            start: range.start,
            end: range.end,
        }
    }

    /// Create an invalid key error
    pub fn invalid_key<S: Into<String>>(message: S) -> Self {
        Self::InvalidKey(message.into())
    }
}
