//! Log record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{DocNumericId, Sequence};

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"RVLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing CRC32.
pub const CRC_SIZE: usize = 4;

/// Type of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A document was registered.
    Document = 1,
    /// A revision was inserted.
    Revision = 2,
    /// A document's winner changed.
    Winner = 3,
    /// A local document was written or removed.
    Local = 4,
}

impl RecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Document),
            2 => Some(Self::Revision),
            3 => Some(Self::Winner),
            4 => Some(Self::Local),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One entry of the revision log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Binds an external document id to a numeric id.
    Document {
        /// Numeric id.
        doc: DocNumericId,
        /// External id.
        external_id: String,
    },

    /// A revision row. Never rewritten.
    Revision {
        /// Assigned sequence.
        sequence: Sequence,
        /// Owning document.
        doc: DocNumericId,
        /// Revision id as text.
        revision_id: String,
        /// Parent revision.
        parent: Option<Sequence>,
        /// Tombstone flag.
        deleted: bool,
        /// Body, absent for stubs.
        body: Option<Vec<u8>>,
    },

    /// Moves the current flag from `previous` to `current` in one step.
    Winner {
        /// Document.
        doc: DocNumericId,
        /// Revision losing the flag.
        previous: Option<Sequence>,
        /// Revision gaining the flag.
        current: Sequence,
    },

    /// A non-replicated key/value entry. `None` removes the key.
    Local {
        /// Key.
        key: String,
        /// Value.
        value: Option<Vec<u8>>,
    },
}

const FLAG_DELETED: u8 = 0b001;
const FLAG_PARENT: u8 = 0b010;
const FLAG_BODY: u8 = 0b100;

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Document { .. } => RecordType::Document,
            Self::Revision { .. } => RecordType::Revision,
            Self::Winner { .. } => RecordType::Winner,
            Self::Local { .. } => RecordType::Local,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a string or body does not fit its length field.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Document { doc, external_id } => {
                buf.extend_from_slice(&doc.as_u64().to_le_bytes());
                put_bytes_u32(&mut buf, external_id.as_bytes(), "document id")?;
            }

            Self::Revision {
                sequence,
                doc,
                revision_id,
                parent,
                deleted,
                body,
            } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
                buf.extend_from_slice(&doc.as_u64().to_le_bytes());

                let mut flags = 0;
                if *deleted {
                    flags |= FLAG_DELETED;
                }
                if parent.is_some() {
                    flags |= FLAG_PARENT;
                }
                if body.is_some() {
                    flags |= FLAG_BODY;
                }
                buf.push(flags);

                if let Some(parent) = parent {
                    buf.extend_from_slice(&parent.as_u64().to_le_bytes());
                }
                put_bytes_u16(&mut buf, revision_id.as_bytes(), "revision id")?;
                if let Some(body) = body {
                    put_bytes_u32(&mut buf, body, "body")?;
                }
            }

            Self::Winner {
                doc,
                previous,
                current,
            } => {
                buf.extend_from_slice(&doc.as_u64().to_le_bytes());
                match previous {
                    Some(previous) => {
                        buf.push(1);
                        buf.extend_from_slice(&previous.as_u64().to_le_bytes());
                    }
                    None => buf.push(0),
                }
                buf.extend_from_slice(&current.as_u64().to_le_bytes());
            }

            Self::Local { key, value } => {
                put_bytes_u16(&mut buf, key.as_bytes(), "local key")?;
                match value {
                    Some(value) => {
                        buf.push(1);
                        put_bytes_u32(&mut buf, value, "local value")?;
                    }
                    None => buf.push(0),
                }
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// `offset` is only used to label errors.
    pub fn decode_payload(record_type: RecordType, payload: &[u8], offset: u64) -> CoreResult<Self> {
        let mut reader = PayloadReader {
            payload,
            cursor: 0,
            offset,
        };

        let record = match record_type {
            RecordType::Document => {
                let doc = DocNumericId::new(reader.u64()?);
                let len = reader.u32()? as usize;
                let external_id = reader.string(len)?;
                Self::Document { doc, external_id }
            }

            RecordType::Revision => {
                let sequence = Sequence::new(reader.u64()?);
                let doc = DocNumericId::new(reader.u64()?);
                let flags = reader.u8()?;
                if flags & !(FLAG_DELETED | FLAG_PARENT | FLAG_BODY) != 0 {
                    return Err(CoreError::log_corruption(
                        offset,
                        format!("unknown revision flags {flags:#04x}"),
                    ));
                }
                let parent = if flags & FLAG_PARENT != 0 {
                    Some(Sequence::new(reader.u64()?))
                } else {
                    None
                };
                let len = reader.u16()? as usize;
                let revision_id = reader.string(len)?;
                let body = if flags & FLAG_BODY != 0 {
                    let len = reader.u32()? as usize;
                    Some(reader.bytes(len)?.to_vec())
                } else {
                    None
                };
                Self::Revision {
                    sequence,
                    doc,
                    revision_id,
                    parent,
                    deleted: flags & FLAG_DELETED != 0,
                    body,
                }
            }

            RecordType::Winner => {
                let doc = DocNumericId::new(reader.u64()?);
                let previous = match reader.u8()? {
                    0 => None,
                    _ => Some(Sequence::new(reader.u64()?)),
                };
                let current = Sequence::new(reader.u64()?);
                Self::Winner {
                    doc,
                    previous,
                    current,
                }
            }

            RecordType::Local => {
                let len = reader.u16()? as usize;
                let key = reader.string(len)?;
                let value = match reader.u8()? {
                    0 => None,
                    _ => {
                        let len = reader.u32()? as usize;
                        Some(reader.bytes(len)?.to_vec())
                    }
                };
                Self::Local { key, value }
            }
        };

        if reader.cursor != payload.len() {
            return Err(CoreError::log_corruption(
                offset,
                format!(
                    "trailing bytes in {:?} record: expected {} bytes, got {}",
                    record_type,
                    reader.cursor,
                    payload.len()
                ),
            ));
        }

        Ok(record)
    }

    /// Encodes the record with its full envelope.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_argument("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        // CRC over everything before it
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

fn put_bytes_u16(buf: &mut Vec<u8>, bytes: &[u8], what: &str) -> CoreResult<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_argument(format!("{what} too long: {} bytes", bytes.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes_u32(buf: &mut Vec<u8>, bytes: &[u8], what: &str) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_argument(format!("{what} too long: {} bytes", bytes.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
    offset: u64,
}

impl<'a> PayloadReader<'a> {
    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::log_corruption(self.offset, "unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self, len: usize) -> CoreResult<String> {
        let offset = self.offset;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::log_corruption(offset, "string is not valid UTF-8"))
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: &LogRecord) -> LogRecord {
        let payload = record.encode_payload().unwrap();
        LogRecord::decode_payload(record.record_type(), &payload, 0).unwrap()
    }

    #[test]
    fn record_type_from_byte() {
        for t in [
            RecordType::Document,
            RecordType::Revision,
            RecordType::Winner,
            RecordType::Local,
        ] {
            assert_eq!(RecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(RecordType::from_byte(0), None);
        assert_eq!(RecordType::from_byte(9), None);
    }

    #[test]
    fn revision_record_with_all_fields() {
        let record = LogRecord::Revision {
            sequence: Sequence::new(7),
            doc: DocNumericId::new(2),
            revision_id: "2-beef".into(),
            parent: Some(Sequence::new(3)),
            deleted: true,
            body: Some(b"{}".to_vec()),
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn stub_revision_record() {
        let record = LogRecord::Revision {
            sequence: Sequence::new(1),
            doc: DocNumericId::new(1),
            revision_id: "1-a".into(),
            parent: None,
            deleted: false,
            body: None,
        };
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn winner_and_local_records() {
        let first = LogRecord::Winner {
            doc: DocNumericId::new(4),
            previous: None,
            current: Sequence::new(10),
        };
        assert_eq!(roundtrip(&first), first);

        let removal = LogRecord::Local {
            key: "checkpoint".into(),
            value: None,
        };
        assert_eq!(roundtrip(&removal), removal);
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let record = LogRecord::Document {
            doc: DocNumericId::new(1),
            external_id: "doc".into(),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        assert!(matches!(
            LogRecord::decode_payload(RecordType::Document, &payload, 42),
            Err(CoreError::LogCorruption { offset: 42, .. })
        ));
    }

    #[test]
    fn short_payload_is_corruption() {
        assert!(matches!(
            LogRecord::decode_payload(RecordType::Winner, &[1, 2, 3], 0),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn envelope_layout() {
        let record = LogRecord::Local {
            key: "k".into(),
            value: Some(vec![1]),
        };
        let data = record.encode().unwrap();
        assert_eq!(&data[0..4], b"RVLG");
        assert_eq!(data[6], RecordType::Local.as_byte());
        let len = u32::from_le_bytes(data[7..11].try_into().unwrap()) as usize;
        assert_eq!(data.len(), HEADER_SIZE + len + CRC_SIZE);

        let crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        assert_eq!(crc, compute_crc32(&data[..data.len() - 4]));
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }
}
