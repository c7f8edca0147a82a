//! The storage backend trait.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// The revision log writes framed records through this trait and replays
/// them on open. Implementations must be `Send + Sync`; the log serializes
/// writers itself, so backends only need interior consistency.
///
/// # Invariants
///
/// - `append` returns the offset the bytes landed at, which equals the
///   `size()` observed immediately before the call
/// - a failed `append` leaves `size()` unchanged
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, everything appended so far survives a crash
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store, or with an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Fails if the write is rejected (I/O error, capacity exhausted).
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes down to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, i.e. the next append offset.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended data and file metadata durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Discards everything after `new_size`.
    ///
    /// Used to cut a torn record off the end of the log during recovery.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
