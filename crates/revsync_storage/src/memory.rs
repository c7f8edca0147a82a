//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A backend that keeps the log in a `Vec<u8>`.
///
/// An optional capacity turns it into a small "disk" that rejects appends
/// once full, which is how tests provoke storage faults in the layers above.
///
/// ```rust
/// use revsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::with_capacity(4);
/// assert!(backend.append(b"abcd").is_ok());
/// assert!(backend.append(b"e").unwrap_err().is_full());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    capacity: Option<u64>,
}

impl InMemoryBackend {
    /// Creates an empty, unbounded backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that holds at most `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    /// Creates a backend preloaded with `data`.
    ///
    /// Pairs with [`InMemoryBackend::data`] to simulate a process restart.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            capacity: None,
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Changes the capacity limit. `None` removes it.
    pub fn set_capacity(&mut self, capacity: Option<u64>) {
        self.capacity = capacity;
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;

        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(offset);
            if bytes.len() as u64 > available {
                return Err(StorageError::Full {
                    requested: bytes.len(),
                    available,
                });
            }
        }

        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_previous_size() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn capacity_rejects_without_partial_write() {
        let mut backend = InMemoryBackend::with_capacity(8);
        backend.append(b"12345").unwrap();

        let err = backend.append(b"6789").unwrap_err();
        assert!(err.is_full());
        assert_eq!(backend.size().unwrap(), 5);

        backend.set_capacity(None);
        backend.append(b"6789").unwrap();
        assert_eq!(backend.size().unwrap(), 9);
    }

    #[test]
    fn truncate_cuts_tail() {
        let mut backend = InMemoryBackend::with_data(b"record+torn".to_vec());
        backend.truncate(6).unwrap();
        assert_eq!(backend.data(), b"record");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }
}
