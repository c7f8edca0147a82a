//! Error types for the revision store.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in revision store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The storage backend rejected a read or write.
    ///
    /// Never retried locally; callers above decide what to do.
    #[error("storage error: {0}")]
    Storage(#[from] revsync_storage::StorageError),

    /// The revision log is corrupted.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Offset of the offending record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the offending record.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// No document with this identifier.
    #[error("document not found: {document}")]
    DocumentNotFound {
        /// External or numeric identifier, rendered.
        document: String,
    },

    /// No revision with this identifier in the document.
    #[error("revision {revision} not found in document {document}")]
    RevisionNotFound {
        /// Document identifier.
        document: String,
        /// Revision identifier.
        revision: String,
    },

    /// A parent sequence does not name a revision of the same document.
    #[error("parent sequence {parent} is not a revision of document {document}")]
    ParentNotFound {
        /// Document identifier.
        document: String,
        /// The rejected parent sequence.
        parent: u64,
    },

    /// A revision identifier is not of the form `<generation>-<token>`.
    #[error("invalid revision id {0:?}")]
    InvalidRevisionId(String),

    /// An edit does not apply to the current state of the document.
    #[error("conflict on document {document}: {message}")]
    Conflict {
        /// Document identifier.
        document: String,
        /// Why the edit was refused.
        message: String,
    },

    /// A caller-supplied value is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates a document not found error.
    pub fn document_not_found(document: impl ToString) -> Self {
        Self::DocumentNotFound {
            document: document.to_string(),
        }
    }

    /// Creates a revision not found error.
    pub fn revision_not_found(document: impl ToString, revision: impl ToString) -> Self {
        Self::RevisionNotFound {
            document: document.to_string(),
            revision: revision.to_string(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(document: impl ToString, message: impl Into<String>) -> Self {
        Self::Conflict {
            document: document.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error came from the storage backend.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
