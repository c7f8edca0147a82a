//! Core type definitions.

use crate::error::{CoreError, CoreResult};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};

/// Global insertion order of a revision.
///
/// Assigned when a revision is appended to the log. Strictly increasing
/// across all documents and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Sequence value that precedes every stored revision.
    pub const ZERO: Self = Self(0);

    /// Creates a new sequence.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Internal numeric identifier of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocNumericId(pub u64);

impl DocNumericId {
    /// Creates a new numeric id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocNumericId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc:{}", self.0)
    }
}

/// A parsed revision identifier, `"<generation>-<token>"`.
///
/// The generation is a positive integer equal to the parent's generation
/// plus one. The token is opaque and compared byte-wise when two leaves
/// tie on depth and generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    raw: String,
    generation: u64,
    token_start: usize,
}

impl RevisionId {
    /// Parses a revision identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRevisionId`] unless the input is a
    /// positive decimal generation, a `-`, and a non-empty token.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidRevisionId(raw.to_string());

        let (generation, token) = raw.split_once('-').ok_or_else(invalid)?;
        if generation.is_empty()
            || token.is_empty()
            || !generation.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 {
            return Err(invalid());
        }

        Ok(Self {
            raw: raw.to_string(),
            generation,
            token_start: raw.len() - token.len(),
        })
    }

    /// Derives the id of a locally authored revision.
    ///
    /// The token is the hex SHA-256 of the parent id, the deleted flag and
    /// the body, so the same edit made on two replicas yields the same id.
    #[must_use]
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body);
        let digest = hasher.finalize();

        let generation = parent.map_or(1, |p| p.generation + 1);
        let mut raw = format!("{generation}-");
        let token_start = raw.len();
        for byte in digest {
            let _ = write!(raw, "{byte:02x}");
        }

        Self {
            raw,
            generation,
            token_start,
        }
    }

    /// Returns the generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the token part.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.raw[self.token_start..]
    }

    /// Returns the full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for RevisionId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse(s)
    }
}

/// One revision of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Global insertion order.
    pub sequence: Sequence,
    /// Identifier, unique within the document.
    pub revision_id: RevisionId,
    /// Owning document.
    pub doc_numeric_id: DocNumericId,
    /// Parent revision, `None` for a root.
    pub parent_sequence: Option<Sequence>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Whether this revision is the document's winner.
    pub is_current: bool,
    /// Whether the body is stored locally.
    pub available: bool,
    /// Content, present iff `available`.
    pub body: Option<Vec<u8>>,
}

/// A revision with no children, annotated with its distance from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// The leaf revision.
    pub revision: Revision,
    /// Edges between this leaf and its root; a root has depth 0.
    pub depth: u32,
}

impl Leaf {
    /// Orders leaves so that the winner compares greatest.
    ///
    /// Greater depth wins; then higher generation; then the token compared
    /// byte-wise; then, for identical ids, the later sequence.
    #[must_use]
    pub fn winner_order(&self, other: &Self) -> Ordering {
        let a = &self.revision;
        let b = &other.revision;
        self.depth
            .cmp(&other.depth)
            .then_with(|| a.revision_id.generation().cmp(&b.revision_id.generation()))
            .then_with(|| {
                a.revision_id
                    .token()
                    .as_bytes()
                    .cmp(b.revision_id.token().as_bytes())
            })
            .then_with(|| a.sequence.cmp(&b.sequence))
    }
}

/// Result of inserting a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Sequence of the stored revision (existing one on a duplicate).
    pub sequence: Sequence,
    /// True if the revision already existed and nothing was written.
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_revision_id() {
        let rev = RevisionId::parse("12-abc").unwrap();
        assert_eq!(rev.generation(), 12);
        assert_eq!(rev.token(), "abc");
        assert_eq!(rev.as_str(), "12-abc");
        assert_eq!(rev.to_string(), "12-abc");
    }

    #[test]
    fn token_may_contain_dashes() {
        let rev = RevisionId::parse("3-a-b").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.token(), "a-b");
    }

    #[test]
    fn reject_malformed_revision_ids() {
        for raw in ["", "abc", "1-", "-abc", "0-abc", "x1-abc", "+1-abc", "1abc"] {
            assert!(
                matches!(RevisionId::parse(raw), Err(CoreError::InvalidRevisionId(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn derived_ids_are_content_addressed() {
        let root = RevisionId::derive(None, false, b"{}");
        assert_eq!(root.generation(), 1);
        assert_eq!(root.token().len(), 64);
        assert_eq!(root, RevisionId::derive(None, false, b"{}"));
        assert_ne!(root, RevisionId::derive(None, true, b"{}"));

        let child = RevisionId::derive(Some(&root), false, b"{\"a\":1}");
        assert_eq!(child.generation(), 2);
        assert_eq!(RevisionId::parse(child.as_str()).unwrap(), child);
    }

    #[test]
    fn sequence_next() {
        assert_eq!(Sequence::new(5).next(), Sequence::new(6));
        assert!(Sequence::ZERO < Sequence::new(1));
        assert_eq!(format!("{}", DocNumericId::new(3)), "doc:3");
    }
}
