//! # RevSync Storage
//!
//! Append-only byte stores underneath the RevSync revision log.
//!
//! A backend knows nothing about revisions, documents or record framing.
//! It hands out offsets for appended bytes, reads them back, and can cut a
//! torn tail off after a crash. Everything above that (record envelopes,
//! checksums, replay) belongs to `revsync_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests, with an optional
//!   capacity limit for simulating a full disk
//! - [`FileBackend`] - a single append-only file
//!
//! ## Example
//!
//! ```rust
//! use revsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"rev-1").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"rev-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
