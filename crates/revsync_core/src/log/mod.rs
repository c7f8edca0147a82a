//! Durable revision log.
//!
//! Every revision row, winner change, document registration and local
//! document write is persisted as one framed record:
//!
//! ```text
//! | magic "RVLG" (4) | version (2) | type (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! The in-memory index of the store is rebuilt from this log on open.

mod record;
mod writer;

pub use record::{compute_crc32, LogRecord, RecordType, LOG_MAGIC, LOG_VERSION};
pub use writer::{ReplayStats, RevisionLog};
