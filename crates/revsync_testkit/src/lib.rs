//! # RevSync Testkit
//!
//! Test utilities for RevSync.
//!
//! This crate provides:
//! - Datastore fixtures (in-memory and file-backed with cleanup)
//! - Property-based generators for revision ids, documents and edit scripts
//! - A scripted peer for fault injection and checkpoint assertions
//! - A controller harness wired to recording collaborators
//!
//! ## Usage
//!
//! ```rust
//! use revsync_testkit::prelude::*;
//!
//! let pair = ReplicaPair::new();
//! pair.remote.create_document("a", b"1".to_vec()).unwrap();
//! pair.pull().run_once().unwrap();
//! assert!(pair.local.get_document("a").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod peers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::peers::*;
}

pub use fixtures::*;
pub use generators::*;
pub use peers::*;
