//! Log writer and replay.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{
    compute_crc32, LogRecord, RecordType, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION,
};
use crate::types::Sequence;
use parking_lot::Mutex;
use revsync_storage::StorageBackend;
use tracing::{debug, warn};

struct LogState {
    backend: Box<dyn StorageBackend>,
    next_sequence: Sequence,
}

/// Outcome of replaying a log on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied.
    pub records: u64,
    /// Bytes of torn tail that were cut off, if any.
    pub truncated_bytes: u64,
}

/// The append-only revision log.
///
/// Every mutation of the store is one framed record. Sequences are handed
/// out under the same lock that performs the append, so a sequence exists
/// only if its record reached the backend, and sequence order matches log
/// order.
pub struct RevisionLog {
    state: Mutex<LogState>,
    sync_on_write: bool,
}

impl RevisionLog {
    /// Replays `backend` through `apply`, then returns a log ready for appends.
    ///
    /// A record cut short by a crash ends the log: the torn bytes are
    /// truncated away with a warning. A record that is complete but fails
    /// its checksum, magic or type check is fatal.
    ///
    /// # Errors
    ///
    /// Returns the first error from the backend, from decoding, or from `apply`.
    pub fn open<F>(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        mut apply: F,
    ) -> CoreResult<(Self, ReplayStats)>
    where
        F: FnMut(u64, LogRecord) -> CoreResult<()>,
    {
        let size = backend.size()?;
        let mut stats = ReplayStats::default();
        let mut max_sequence = Sequence::ZERO;
        let mut offset = 0u64;

        while offset < size {
            match read_record(backend.as_ref(), offset, size)? {
                Some((record, next)) => {
                    if let LogRecord::Revision { sequence, .. } = &record {
                        if *sequence <= max_sequence {
                            return Err(CoreError::log_corruption(
                                offset,
                                format!("sequence {} after {}", sequence, max_sequence),
                            ));
                        }
                        max_sequence = *sequence;
                    }
                    apply(offset, record)?;
                    stats.records += 1;
                    offset = next;
                }
                None => {
                    stats.truncated_bytes = size - offset;
                    warn!(
                        offset,
                        bytes = stats.truncated_bytes,
                        "truncating torn record at end of revision log"
                    );
                    backend.truncate(offset)?;
                    break;
                }
            }
        }

        debug!(records = stats.records, last_sequence = max_sequence.as_u64(), "revision log replayed");

        let log = Self {
            state: Mutex::new(LogState {
                backend,
                next_sequence: max_sequence.next(),
            }),
            sync_on_write,
        };
        Ok((log, stats))
    }

    /// Appends a record that does not carry a sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the backend rejects the write.
    pub fn append(&self, record: &LogRecord) -> CoreResult<u64> {
        let data = record.encode()?;
        let mut state = self.state.lock();
        self.write(&mut state, &data)
    }

    /// Allocates the next sequence, builds a record with it, appends it and
    /// hands it to `apply`.
    ///
    /// The sequence is consumed only if the append succeeds. `apply` runs
    /// while the log lock is still held, so once [`RevisionLog::last_sequence`]
    /// reports a sequence, whatever `apply` did with it is already visible.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the backend rejects the write;
    /// `apply` is not called in that case.
    pub fn append_sequenced<B, A, T>(&self, build: B, apply: A) -> CoreResult<T>
    where
        B: FnOnce(Sequence) -> LogRecord,
        A: FnOnce(Sequence, LogRecord) -> T,
    {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        let record = build(sequence);
        let data = record.encode()?;
        self.write(&mut state, &data)?;
        state.next_sequence = sequence.next();
        Ok(apply(sequence, record))
    }

    fn write(&self, state: &mut LogState, data: &[u8]) -> CoreResult<u64> {
        let offset = state.backend.append(data)?;
        if self.sync_on_write {
            state.backend.flush()?;
            state.backend.sync()?;
        }
        Ok(offset)
    }

    /// Returns the highest sequence assigned so far.
    pub fn last_sequence(&self) -> Sequence {
        Sequence::new(self.state.lock().next_sequence.as_u64() - 1)
    }

    /// Forces everything appended so far to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.backend.flush()?;
        state.backend.sync()?;
        Ok(())
    }

    /// Returns the current log size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.state.lock().backend.size()?)
    }
}

/// Reads the record at `offset`.
///
/// Returns `Ok(None)` when the record is incomplete (torn tail), otherwise
/// the record and the offset just past it.
fn read_record(
    backend: &dyn StorageBackend,
    offset: u64,
    size: u64,
) -> CoreResult<Option<(LogRecord, u64)>> {
    let remaining = size - offset;
    if remaining < HEADER_SIZE as u64 {
        return Ok(None);
    }

    let header = backend.read_at(offset, HEADER_SIZE)?;
    if header[0..4] != LOG_MAGIC {
        return Err(CoreError::log_corruption(offset, "invalid magic"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > LOG_VERSION {
        return Err(CoreError::log_corruption(
            offset,
            format!("unsupported version {version}"),
        ));
    }

    let type_byte = header[6];
    let record_type = RecordType::from_byte(type_byte).ok_or_else(|| {
        CoreError::log_corruption(offset, format!("unknown record type {type_byte}"))
    })?;

    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    let total = (HEADER_SIZE + len + CRC_SIZE) as u64;
    if remaining < total {
        return Ok(None);
    }

    let rest = backend.read_at(offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
    let (payload, crc_bytes) = rest.split_at(len);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    let mut covered = header;
    covered.extend_from_slice(payload);
    let actual = compute_crc32(&covered);
    if actual != expected {
        return Err(CoreError::ChecksumMismatch {
            offset,
            expected,
            actual,
        });
    }

    let record = LogRecord::decode_payload(record_type, payload, offset)?;
    Ok(Some((record, offset + total)))
}
