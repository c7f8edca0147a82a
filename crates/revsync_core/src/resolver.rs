//! Deterministic winner selection.
//!
//! Every replica holding the same set of leaves picks the same winner,
//! regardless of the order in which revisions arrived:
//!
//! 1. greatest depth (longest edit history)
//! 2. then highest generation
//! 3. then the revision token compared byte-wise, greater wins
//!
//! Deleted leaves compete like any other leaf.

use crate::error::CoreResult;
use crate::store::{DocumentWriter, RevisionStore};
use crate::types::{DocNumericId, Leaf, Sequence};
use tracing::debug;

/// Picks the winning leaf, or `None` for an empty set.
#[must_use]
pub fn compute_winner(leaves: &[Leaf]) -> Option<&Leaf> {
    leaves.iter().max_by(|a, b| a.winner_order(b))
}

/// Returns true if more than one leaf is not deleted.
#[must_use]
pub fn has_conflicts(leaves: &[Leaf]) -> bool {
    leaves.iter().filter(|leaf| !leaf.revision.deleted).count() > 1
}

/// Recomputes the winner of the document behind `writer`.
///
/// Writes a winner record only when the winner actually changes. Returns
/// the sequence of the current revision afterwards, `None` if the document
/// has no revisions.
pub fn resolve_in(writer: &mut DocumentWriter<'_>) -> CoreResult<Option<Sequence>> {
    let leaves = writer.tree().leaves();
    let Some(winner) = compute_winner(&leaves) else {
        return Ok(None);
    };
    let winner = winner.revision.sequence;

    let previous = writer.tree().current().map(|r| r.sequence);
    if previous != Some(winner) {
        writer.set_current(winner)?;
        debug!(
            doc = writer.tree().doc().as_u64(),
            previous = previous.map(Sequence::as_u64),
            current = winner.as_u64(),
            "winner changed"
        );
    }
    Ok(Some(winner))
}

/// Conflict resolution over a [`RevisionStore`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Recomputes and records the winner of `doc`.
    pub fn resolve(store: &RevisionStore, doc: DocNumericId) -> CoreResult<Option<Sequence>> {
        store.with_document(doc, resolve_in)
    }

    /// Returns true if `doc` has more than one non-deleted leaf.
    pub fn is_conflicted(store: &RevisionStore, doc: DocNumericId) -> CoreResult<bool> {
        store.read_document(doc, |tree| has_conflicts(&tree.leaves()))
    }

    /// Re-resolves every document, returning how many winners moved.
    pub fn resolve_all(store: &RevisionStore) -> CoreResult<usize> {
        let mut repaired = 0;
        for doc in store.document_ids() {
            let moved = store.with_document(doc, |writer| {
                let before = writer.tree().current().map(|r| r.sequence);
                Ok(resolve_in(writer)? != before)
            })?;
            if moved {
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
