//! # RevSync Core
//!
//! An embedded, multi-version document store built on per-document revision
//! trees.
//!
//! Every edit appends a revision that points at its parent by sequence.
//! Concurrent edits on different replicas become sibling branches; a
//! deterministic rule picks one leaf as the document's current revision so
//! that every replica holding the same revisions agrees on the winner.
//!
//! ## Layers
//!
//! - [`RevisionStore`] - durable revision rows, per-document writer lanes,
//!   leaf queries and the changes feed
//! - [`resolver`] - winner selection and conflict detection
//! - [`Datastore`] - document-level API: local edits, merging replicated
//!   revisions, revision diffs and local (non-replicated) documents
//!
//! ## Example
//!
//! ```rust
//! use revsync_core::{Datastore, RemoteRevision};
//!
//! let db = Datastore::open_in_memory().unwrap();
//! let base = db.create_document("todo", b"milk".to_vec()).unwrap();
//!
//! // a replica edited the same base concurrently
//! db.force_insert(RemoteRevision {
//!     document_id: "todo".into(),
//!     history: vec![base.revision_id.to_string(), "2-ffff".into()],
//!     deleted: false,
//!     body: Some(b"milk, eggs".to_vec()),
//! })
//! .unwrap();
//! db.update_document("todo", base.revision_id.as_str(), b"bread".to_vec())
//!     .unwrap();
//!
//! assert!(db.is_conflicted("todo").unwrap());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod datastore;
mod error;
pub mod log;
pub mod resolver;
mod store;
mod types;

pub use config::StoreConfig;
pub use datastore::{Datastore, DocumentRevision, RemoteRevision};
pub use error::{CoreError, CoreResult};
pub use resolver::ConflictResolver;
pub use store::{Changes, DocumentChange, DocumentTree, DocumentWriter, RevisionStore};
pub use types::{DocNumericId, InsertOutcome, Leaf, Revision, RevisionId, Sequence};
