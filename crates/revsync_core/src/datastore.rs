//! Document-level facade over the revision store.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::resolver::{has_conflicts, resolve_in, ConflictResolver};
use crate::store::{Changes, DocumentTree, DocumentWriter, RevisionStore};
use crate::types::{DocNumericId, Leaf, Revision, RevisionId, Sequence};
use revsync_storage::{FileBackend, StorageBackend};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A revision as seen through the document API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRevision {
    /// External document id.
    pub document_id: String,
    /// Revision id.
    pub revision_id: RevisionId,
    /// Sequence the revision was stored at.
    pub sequence: Sequence,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Content, `None` for stubs.
    pub body: Option<Vec<u8>>,
}

impl DocumentRevision {
    fn from_revision(document_id: &str, revision: &Revision) -> Self {
        Self {
            document_id: document_id.to_string(),
            revision_id: revision.revision_id.clone(),
            sequence: revision.sequence,
            deleted: revision.deleted,
            body: revision.body.clone(),
        }
    }
}

/// A revision travelling between replicas, with its ancestry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRevision {
    /// External document id.
    pub document_id: String,
    /// Revision ids from the oldest known ancestor down to this revision.
    pub history: Vec<String>,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// Content of the last revision in `history`.
    pub body: Option<Vec<u8>>,
}

impl RemoteRevision {
    /// The revision id this payload carries.
    #[must_use]
    pub fn revision_id(&self) -> Option<&str> {
        self.history.last().map(String::as_str)
    }
}

/// An embedded document store with revision trees.
///
/// Local edits create children of a leaf; replicated revisions are merged
/// with [`Datastore::force_insert_batch`]. After every write the document's
/// winner is recomputed while its lane lock is still held.
///
/// ```rust
/// use revsync_core::Datastore;
///
/// let db = Datastore::open_in_memory().unwrap();
/// let first = db.create_document("note", b"{\"v\":1}".to_vec()).unwrap();
/// let second = db
///     .update_document("note", first.revision_id.as_str(), b"{\"v\":2}".to_vec())
///     .unwrap();
///
/// assert_eq!(second.revision_id.generation(), 2);
/// assert_eq!(db.get_document("note").unwrap().unwrap(), second);
/// ```
pub struct Datastore {
    store: RevisionStore,
}

impl Datastore {
    /// Opens (or creates) a datastore backed by the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its log is corrupted.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        info!(path = %path.display(), "opening datastore");
        Self::open_with_backend(Box::new(backend), config)
    }

    /// Opens a datastore on an arbitrary backend.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        let resolve_on_open = config.resolve_on_open;
        let store = RevisionStore::open(backend, config)?;
        if resolve_on_open {
            let repaired = ConflictResolver::resolve_all(&store)?;
            if repaired > 0 {
                warn!(documents = repaired, "repaired stale winners after restart");
            }
        }
        Ok(Self { store })
    }

    /// Opens an empty in-memory datastore.
    pub fn open_in_memory() -> CoreResult<Self> {
        Ok(Self {
            store: RevisionStore::open_in_memory()?,
        })
    }

    /// The underlying revision store.
    #[must_use]
    pub fn store(&self) -> &RevisionStore {
        &self.store
    }

    fn numeric_id(&self, document_id: &str) -> CoreResult<DocNumericId> {
        self.store
            .document_numeric_id(document_id)
            .ok_or_else(|| CoreError::document_not_found(document_id))
    }

    /// Creates a document with a first revision.
    ///
    /// A document whose winner is a tombstone is revived: the new revision
    /// becomes a child of the tombstone.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] if the document exists and is not deleted.
    pub fn create_document(&self, document_id: &str, body: Vec<u8>) -> CoreResult<DocumentRevision> {
        let doc = self.store.create_document(document_id)?;
        self.store.with_document(doc, |writer| {
            let parent = match writer.tree().current() {
                Some(current) if !current.deleted => {
                    return Err(CoreError::conflict(document_id, "document already exists"));
                }
                Some(tombstone) => Some((tombstone.sequence, tombstone.revision_id.clone())),
                None => None,
            };
            local_edit(writer, parent, false, body)
        })
    }

    /// Creates a document under a freshly generated id.
    pub fn create_document_with_generated_id(&self, body: Vec<u8>) -> CoreResult<DocumentRevision> {
        let document_id = Uuid::new_v4().simple().to_string();
        self.create_document(&document_id, body)
    }

    /// Adds a child revision to the leaf `parent_revision`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DocumentNotFound`] / [`CoreError::RevisionNotFound`]
    /// - [`CoreError::Conflict`] if the parent is not a live leaf
    pub fn update_document(
        &self,
        document_id: &str,
        parent_revision: &str,
        body: Vec<u8>,
    ) -> CoreResult<DocumentRevision> {
        self.edit_leaf(document_id, parent_revision, false, body)
    }

    /// Adds a tombstone under the leaf `parent_revision`.
    pub fn delete_document(&self, document_id: &str, parent_revision: &str) -> CoreResult<DocumentRevision> {
        self.edit_leaf(document_id, parent_revision, true, Vec::new())
    }

    fn edit_leaf(
        &self,
        document_id: &str,
        parent_revision: &str,
        deleted: bool,
        body: Vec<u8>,
    ) -> CoreResult<DocumentRevision> {
        let doc = self.numeric_id(document_id)?;
        self.store.with_document(doc, |writer| {
            let parent = live_leaf(writer.tree(), parent_revision)?;
            local_edit(writer, Some(parent), deleted, body)
        })
    }

    /// Returns the winning revision, or `None` if the document is unknown,
    /// has no revisions, or its winner is a tombstone.
    pub fn get_document(&self, document_id: &str) -> CoreResult<Option<DocumentRevision>> {
        let Some(doc) = self.store.document_numeric_id(document_id) else {
            return Ok(None);
        };
        self.store.read_document(doc, |tree| {
            tree.current()
                .filter(|current| !current.deleted)
                .map(|current| DocumentRevision::from_revision(document_id, current))
        })
    }

    /// Returns a specific revision of a document.
    pub fn get_revision(
        &self,
        document_id: &str,
        revision_id: &str,
    ) -> CoreResult<Option<DocumentRevision>> {
        let Some(doc) = self.store.document_numeric_id(document_id) else {
            return Ok(None);
        };
        self.store.read_document(doc, |tree| {
            tree.revision(revision_id)
                .map(|revision| DocumentRevision::from_revision(document_id, revision))
        })
    }

    /// Returns every leaf of a document.
    pub fn leaves(&self, document_id: &str) -> CoreResult<Vec<Leaf>> {
        self.store.get_leaves(self.numeric_id(document_id)?)
    }

    /// Returns true if the document has more than one live leaf.
    pub fn is_conflicted(&self, document_id: &str) -> CoreResult<bool> {
        ConflictResolver::is_conflicted(&self.store, self.numeric_id(document_id)?)
    }

    /// Ids of every document that is in conflict.
    pub fn conflicted_documents(&self) -> CoreResult<Vec<String>> {
        let mut conflicted = Vec::new();
        for doc in self.store.document_ids() {
            if let Some(id) = self.store.read_document(doc, |tree| {
                has_conflicts(&tree.leaves()).then(|| tree.external_id().to_string())
            })? {
                conflicted.push(id);
            }
        }
        Ok(conflicted)
    }

    /// Merges one replicated revision; see [`Datastore::force_insert_batch`].
    pub fn force_insert(&self, revision: RemoteRevision) -> CoreResult<bool> {
        Ok(self.force_insert_batch(vec![revision])? == 1)
    }

    /// Merges a batch of replicated revisions.
    ///
    /// Each revision arrives with its ancestry. Ancestors that are missing
    /// locally are inserted as unavailable stubs below the deepest ancestor
    /// that is already present. Revisions already present are skipped.
    ///
    /// All inserts for one document happen under its lane lock and are
    /// followed by a single resolution, so readers never see a half-applied
    /// batch. Returns how many revisions were new.
    pub fn force_insert_batch(&self, revisions: Vec<RemoteRevision>) -> CoreResult<usize> {
        let mut by_document: BTreeMap<String, Vec<RemoteRevision>> = BTreeMap::new();
        for revision in revisions {
            by_document
                .entry(revision.document_id.clone())
                .or_default()
                .push(revision);
        }

        let mut inserted = 0;
        for (document_id, revisions) in by_document {
            let doc = self.store.create_document(&document_id)?;
            let merged = self.store.with_document(doc, |writer| {
                let mut merged = 0;
                for revision in revisions {
                    if merge_remote(writer, revision)? {
                        merged += 1;
                    }
                }
                resolve_in(writer)?;
                Ok(merged)
            })?;
            debug!(document = %document_id, merged, "merged remote revisions");
            inserted += merged;
        }
        Ok(inserted)
    }

    /// Returns, per document, the revision ids from `revisions` not stored here.
    ///
    /// Documents with nothing missing are left out.
    pub fn revs_diff(
        &self,
        revisions: &BTreeMap<String, Vec<String>>,
    ) -> CoreResult<BTreeMap<String, Vec<String>>> {
        let mut missing = BTreeMap::new();
        for (document_id, revision_ids) in revisions {
            let absent: Vec<String> = match self.store.document_numeric_id(document_id) {
                None => revision_ids.clone(),
                Some(doc) => self.store.read_document(doc, |tree| {
                    revision_ids
                        .iter()
                        .filter(|id| tree.revision(id).is_none())
                        .cloned()
                        .collect()
                })?,
            };
            if !absent.is_empty() {
                missing.insert(document_id.clone(), absent);
            }
        }
        Ok(missing)
    }

    /// Looks up a revision together with its ancestry, ready to send to a peer.
    pub fn revision_with_history(
        &self,
        document_id: &str,
        revision_id: &str,
    ) -> CoreResult<Option<RemoteRevision>> {
        let Some(doc) = self.store.document_numeric_id(document_id) else {
            return Ok(None);
        };
        self.store.read_document(doc, |tree| {
            tree.revision(revision_id).map(|revision| RemoteRevision {
                document_id: document_id.to_string(),
                history: tree
                    .ancestry(revision.sequence)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                deleted: revision.deleted,
                body: revision.body.clone(),
            })
        })
    }

    /// Documents changed after `since`; see [`RevisionStore::changes_since`].
    #[must_use]
    pub fn changes(&self, since: Sequence, limit: usize) -> Changes {
        self.store.changes_since(since, limit)
    }

    /// Writes a non-replicated local document.
    pub fn put_local(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.store.put_local(key, Some(value))
    }

    /// Reads a local document.
    #[must_use]
    pub fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get_local(key)
    }

    /// Removes a local document.
    pub fn delete_local(&self, key: &str) -> CoreResult<()> {
        self.store.put_local(key, None)
    }

    /// Number of documents, deleted ones included.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.store.document_count()
    }

    /// Highest sequence assigned so far.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.store.last_sequence()
    }

    /// Forces all writes to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.store.sync()
    }
}

fn live_leaf(tree: &DocumentTree, revision_id: &str) -> CoreResult<(Sequence, RevisionId)> {
    let revision = tree
        .revision(revision_id)
        .ok_or_else(|| CoreError::revision_not_found(tree.external_id(), revision_id))?;
    if !tree.is_leaf(revision.sequence) {
        return Err(CoreError::conflict(
            tree.external_id(),
            format!("revision {revision_id} is not a leaf"),
        ));
    }
    if revision.deleted {
        return Err(CoreError::conflict(
            tree.external_id(),
            format!("revision {revision_id} is deleted"),
        ));
    }
    Ok((revision.sequence, revision.revision_id.clone()))
}

fn local_edit(
    writer: &mut DocumentWriter<'_>,
    parent: Option<(Sequence, RevisionId)>,
    deleted: bool,
    body: Vec<u8>,
) -> CoreResult<DocumentRevision> {
    let revision_id = RevisionId::derive(parent.as_ref().map(|(_, id)| id), deleted, &body);
    let outcome = writer.insert_revision(
        &revision_id,
        parent.map(|(sequence, _)| sequence),
        deleted,
        Some(body),
    )?;
    resolve_in(writer)?;

    let tree = writer.tree();
    let revision = tree
        .revision_by_sequence(outcome.sequence)
        .ok_or_else(|| CoreError::revision_not_found(tree.external_id(), &revision_id))?;
    Ok(DocumentRevision::from_revision(tree.external_id(), revision))
}

fn merge_remote(writer: &mut DocumentWriter<'_>, remote: RemoteRevision) -> CoreResult<bool> {
    let history = remote
        .history
        .iter()
        .map(|id| RevisionId::parse(id))
        .collect::<CoreResult<Vec<_>>>()?;
    let Some(leaf) = history.last() else {
        return Err(CoreError::invalid_argument(format!(
            "revision of {} has an empty history",
            remote.document_id
        )));
    };
    if writer.tree().revision(leaf.as_str()).is_some() {
        return Ok(false);
    }

    let anchor = history
        .iter()
        .rposition(|id| writer.tree().revision(id.as_str()).is_some());
    let mut parent = anchor
        .and_then(|i| writer.tree().revision(history[i].as_str()))
        .map(|r| r.sequence);
    let first_new = anchor.map_or(0, |i| i + 1);
    let last = history.len() - 1;

    let mut body = remote.body;
    for (index, revision_id) in history.iter().enumerate().skip(first_new) {
        let is_leaf = index == last;
        let outcome = writer.insert_revision(
            revision_id,
            parent,
            is_leaf && remote.deleted,
            if is_leaf { body.take() } else { None },
        )?;
        parent = Some(outcome.sequence);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn remote(document_id: &str, history: &[&str], body: &[u8]) -> RemoteRevision {
        RemoteRevision {
            document_id: document_id.to_string(),
            history: history.iter().map(|s| s.to_string()).collect(),
            deleted: false,
            body: Some(body.to_vec()),
        }
    }

    #[test]
    fn create_update_delete() {
        let db = Datastore::open_in_memory().unwrap();
        let v1 = db.create_document("a", b"one".to_vec()).unwrap();
        assert_eq!(v1.revision_id.generation(), 1);

        let v2 = db.update_document("a", v1.revision_id.as_str(), b"two".to_vec()).unwrap();
        assert_eq!(db.get_document("a").unwrap().unwrap().body, Some(b"two".to_vec()));

        let stale = db.update_document("a", v1.revision_id.as_str(), b"x".to_vec());
        assert!(matches!(stale, Err(CoreError::Conflict { .. })));

        let gone = db.delete_document("a", v2.revision_id.as_str()).unwrap();
        assert!(gone.deleted);
        assert!(db.get_document("a").unwrap().is_none());
        assert!(db.get_revision("a", v2.revision_id.as_str()).unwrap().is_some());
    }

    #[test]
    fn create_existing_document_conflicts() {
        let db = Datastore::open_in_memory().unwrap();
        db.create_document("a", b"x".to_vec()).unwrap();
        assert!(matches!(
            db.create_document("a", b"y".to_vec()),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn recreate_after_delete_extends_tombstone() {
        let db = Datastore::open_in_memory().unwrap();
        let v1 = db.create_document("a", b"x".to_vec()).unwrap();
        let tomb = db.delete_document("a", v1.revision_id.as_str()).unwrap();
        let again = db.create_document("a", b"y".to_vec()).unwrap();

        assert_eq!(again.revision_id.generation(), 3);
        let leaves = db.leaves("a").unwrap();
        assert_eq!(leaves.len(), 1);
        assert_ne!(leaves[0].revision.sequence, tomb.sequence);
    }

    #[test]
    fn generated_ids_are_unique() {
        let db = Datastore::open_in_memory().unwrap();
        let a = db.create_document_with_generated_id(b"x".to_vec()).unwrap();
        let b = db.create_document_with_generated_id(b"x".to_vec()).unwrap();
        assert_ne!(a.document_id, b.document_id);
        assert_eq!(db.document_count(), 2);
    }

    #[test]
    fn force_insert_creates_stubs_and_skips_duplicates() {
        let db = Datastore::open_in_memory().unwrap();
        assert!(db.force_insert(remote("d", &["1-a", "2-b", "3-c"], b"c")).unwrap());
        assert!(!db.force_insert(remote("d", &["1-a", "2-b", "3-c"], b"c")).unwrap());

        let stub = db.get_revision("d", "2-b").unwrap().unwrap();
        assert!(stub.body.is_none());
        let leaf = db.get_document("d").unwrap().unwrap();
        assert_eq!(leaf.revision_id.as_str(), "3-c");
        assert_eq!(leaf.body, Some(b"c".to_vec()));
    }

    #[test]
    fn force_insert_attaches_below_deepest_known_ancestor() {
        let db = Datastore::open_in_memory().unwrap();
        db.force_insert(remote("d", &["1-a", "2-b"], b"b")).unwrap();
        // history no longer reaches the root
        db.force_insert(remote("d", &["2-b", "3-c", "4-d"], b"d")).unwrap();

        let leaves = db.leaves("d").unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].revision.revision_id.as_str(), "4-d");
        assert_eq!(leaves[0].depth, 3);
    }

    #[test]
    fn concurrent_edits_conflict_and_converge() {
        let db = Datastore::open_in_memory().unwrap();
        let base = db.create_document("d", b"base".to_vec()).unwrap();
        let root = base.revision_id.to_string();

        db.force_insert_batch(vec![
            remote("d", &[&root, "2-aaa"], b"left"),
            remote("d", &[&root, "2-zzz"], b"right"),
        ])
        .unwrap();

        assert!(db.is_conflicted("d").unwrap());
        assert_eq!(db.conflicted_documents().unwrap(), vec!["d".to_string()]);
        assert_eq!(db.get_document("d").unwrap().unwrap().revision_id.as_str(), "2-zzz");

        let tombstone = db.delete_document("d", "2-aaa").unwrap();
        assert!(!db.is_conflicted("d").unwrap());
        // the tombstone is deeper than 2-zzz, so the document reads as deleted
        assert_eq!(tombstone.revision_id.generation(), 3);
        assert!(db.get_document("d").unwrap().is_none());

        let revived = db.update_document("d", "2-zzz", b"merged".to_vec());
        assert!(revived.is_ok());
    }

    #[test]
    fn revs_diff_reports_missing() {
        let db = Datastore::open_in_memory().unwrap();
        db.force_insert(remote("d", &["1-a"], b"a")).unwrap();

        let mut asked = BTreeMap::new();
        asked.insert("d".to_string(), vec!["1-a".to_string(), "2-b".to_string()]);
        asked.insert("e".to_string(), vec!["1-x".to_string()]);
        asked.insert("f".to_string(), Vec::new());

        let missing = db.revs_diff(&asked).unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(missing["d"], vec!["2-b".to_string()]);
        assert_eq!(missing["e"], vec!["1-x".to_string()]);
    }

    #[test]
    fn revision_with_history_walks_ancestry() {
        let db = Datastore::open_in_memory().unwrap();
        db.force_insert(remote("d", &["1-a", "2-b"], b"b")).unwrap();
        let payload = db.revision_with_history("d", "2-b").unwrap().unwrap();
        assert_eq!(payload.history, vec!["1-a".to_string(), "2-b".to_string()]);
        assert_eq!(payload.revision_id(), Some("2-b"));
        assert!(db.revision_with_history("d", "9-z").unwrap().is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db").join("revisions.log");
        let (v2, seq) = {
            let db = Datastore::open(&path, StoreConfig::default()).unwrap();
            let v1 = db.create_document("a", b"1".to_vec()).unwrap();
            let v2 = db.update_document("a", v1.revision_id.as_str(), b"2".to_vec()).unwrap();
            db.put_local("checkpoint", b"7".to_vec()).unwrap();
            (v2, db.last_sequence())
        };

        let db = Datastore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(db.get_document("a").unwrap().unwrap(), v2);
        assert_eq!(db.last_sequence(), seq);
        assert_eq!(db.get_local("checkpoint"), Some(b"7".to_vec()));

        let v3 = db.update_document("a", v2.revision_id.as_str(), b"3".to_vec()).unwrap();
        assert!(v3.sequence > seq);
    }
}
