//! Storage error types.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected the operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read reached beyond the end of the store.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Store size at the time of the read.
        size: u64,
    },

    /// The store has no room left for the write.
    #[error("storage full: {requested} bytes requested, {available} available")]
    Full {
        /// Bytes the caller tried to append.
        requested: usize,
        /// Bytes still free.
        available: u64,
    },

    /// A truncate asked to grow the store.
    #[error("cannot truncate to {requested} bytes, store holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },
}

impl StorageError {
    /// Returns true if the failure came from running out of space.
    pub fn is_full(&self) -> bool {
        matches!(self, StorageError::Full { .. })
    }
}
