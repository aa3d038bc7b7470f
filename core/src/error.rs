//! Error types for the document engine
//!
//! Every caller contract violation surfaces as a [`SyncError`] value instead
//! of aborting the host process.

use crate::id::ID;
use thiserror::Error;

/// Errors produced by documents, transactions and the update codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Sequence index or range outside of the current length
    #[error("index {index} out of bounds (length: {len})")]
    IndexOutOfBounds { index: u32, len: u32 },

    /// A shared type handle was used with a transaction of another document
    #[error("no active transaction for the document owning this shared type")]
    NoActiveTransaction,

    /// A transaction is already open on this document
    #[error("another transaction is already active on this document")]
    ConcurrentTransaction,

    /// Block id is absent or was reclaimed by garbage collection
    #[error("block {0} not found")]
    NotFound(ID),

    /// Block references an id that is not yet present locally
    #[error("causal dependency {0} is missing")]
    CausalGap(ID),

    /// Root name is already bound to a different shared type
    #[error("shared type '{name}' is a {actual}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Payload ended before a complete value could be read
    #[error("unexpected end of payload")]
    UnexpectedEof,

    /// Payload carries an unknown format version
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    /// Payload is malformed
    #[error("malformed payload: {0}")]
    Decode(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SyncError::IndexOutOfBounds { index: 7, len: 3 };
        assert_eq!(err.to_string(), "index 7 out of bounds (length: 3)");

        let err = SyncError::NotFound(ID::new(4, 10));
        assert_eq!(err.to_string(), "block 4:10 not found");
    }
}
