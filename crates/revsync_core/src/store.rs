//! Revision storage.
//!
//! [`RevisionStore`] owns the durable log and an in-memory index of every
//! document's revision tree. Each document has its own lane: an
//! `Arc<Mutex<DocumentTree>>` that serializes writers of that document while
//! other documents proceed in parallel. The catalog that maps ids to lanes is
//! only locked long enough to look up or register a lane.
//!
//! Lock order is catalog, then lane, then log. The catalog lock is never held
//! while waiting for a lane.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::log::{LogRecord, ReplayStats, RevisionLog};
use crate::types::{DocNumericId, InsertOutcome, Leaf, Revision, RevisionId, Sequence};
use parking_lot::{Mutex, RwLock};
use revsync_storage::{InMemoryBackend, StorageBackend};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
struct Node {
    revision: Revision,
    depth: u32,
    children: u32,
}

/// The revision tree of one document.
///
/// Revisions are kept in sequence order. A document may have several roots
/// when it was replicated with truncated histories.
#[derive(Debug)]
pub struct DocumentTree {
    doc: DocNumericId,
    external_id: String,
    nodes: Vec<Node>,
    by_revid: HashMap<String, usize>,
    by_sequence: HashMap<Sequence, usize>,
    current: Option<usize>,
}

impl DocumentTree {
    fn new(doc: DocNumericId, external_id: String) -> Self {
        Self {
            doc,
            external_id,
            nodes: Vec::new(),
            by_revid: HashMap::new(),
            by_sequence: HashMap::new(),
            current: None,
        }
    }

    /// Numeric id of the document.
    #[must_use]
    pub fn doc(&self) -> DocNumericId {
        self.doc
    }

    /// External id of the document.
    #[must_use]
    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Number of revisions, stubs included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the document has no revisions yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a revision by id.
    #[must_use]
    pub fn revision(&self, revision_id: &str) -> Option<&Revision> {
        self.by_revid.get(revision_id).map(|&i| &self.nodes[i].revision)
    }

    /// Looks up a revision by sequence.
    #[must_use]
    pub fn revision_by_sequence(&self, sequence: Sequence) -> Option<&Revision> {
        self.by_sequence.get(&sequence).map(|&i| &self.nodes[i].revision)
    }

    /// The revision currently flagged as the winner.
    #[must_use]
    pub fn current(&self) -> Option<&Revision> {
        self.current.map(|i| &self.nodes[i].revision)
    }

    /// All revisions without children, in sequence order.
    #[must_use]
    pub fn leaves(&self) -> Vec<Leaf> {
        self.nodes
            .iter()
            .filter(|node| node.children == 0)
            .map(|node| Leaf {
                revision: node.revision.clone(),
                depth: node.depth,
            })
            .collect()
    }

    /// Returns true if the revision exists and has no children.
    #[must_use]
    pub fn is_leaf(&self, sequence: Sequence) -> bool {
        self.by_sequence
            .get(&sequence)
            .is_some_and(|&i| self.nodes[i].children == 0)
    }

    /// Iterates over all revisions in sequence order.
    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.nodes.iter().map(|node| &node.revision)
    }

    /// Revision ids from the root down to `sequence`, inclusive.
    #[must_use]
    pub fn ancestry(&self, sequence: Sequence) -> Vec<RevisionId> {
        let mut path = Vec::new();
        let mut next = self.by_sequence.get(&sequence).copied();
        while let Some(i) = next {
            let revision = &self.nodes[i].revision;
            path.push(revision.revision_id.clone());
            next = revision
                .parent_sequence
                .and_then(|parent| self.by_sequence.get(&parent).copied());
        }
        path.reverse();
        path
    }

    /// Highest sequence in this document that is not above `limit`.
    #[must_use]
    pub fn last_sequence_up_to(&self, limit: Sequence) -> Option<Sequence> {
        self.nodes
            .iter()
            .rev()
            .map(|node| node.revision.sequence)
            .find(|seq| *seq <= limit)
    }

    fn depth_below(&self, parent: Option<Sequence>) -> CoreResult<u32> {
        match parent {
            None => Ok(0),
            Some(parent) => self
                .by_sequence
                .get(&parent)
                .map(|&i| self.nodes[i].depth + 1)
                .ok_or_else(|| CoreError::ParentNotFound {
                    document: self.external_id.clone(),
                    parent: parent.as_u64(),
                }),
        }
    }

    // Caller has validated the parent with `depth_below`.
    fn push(&mut self, revision: Revision, depth: u32) {
        if let Some(&parent) = revision
            .parent_sequence
            .as_ref()
            .and_then(|p| self.by_sequence.get(p))
        {
            self.nodes[parent].children += 1;
        }
        let index = self.nodes.len();
        self.by_revid
            .insert(revision.revision_id.as_str().to_string(), index);
        self.by_sequence.insert(revision.sequence, index);
        self.nodes.push(Node {
            revision,
            depth,
            children: 0,
        });
    }

    fn flip_current(&mut self, sequence: Sequence) -> CoreResult<Option<Sequence>> {
        let index = *self
            .by_sequence
            .get(&sequence)
            .ok_or_else(|| CoreError::revision_not_found(&self.external_id, sequence))?;
        let previous = self.current.map(|i| {
            self.nodes[i].revision.is_current = false;
            self.nodes[i].revision.sequence
        });
        self.nodes[index].revision.is_current = true;
        self.current = Some(index);
        Ok(previous)
    }
}

/// Exclusive access to one document, handed out by [`RevisionStore::with_document`].
///
/// Everything done through one writer happens under the document's lane
/// lock, so a batch of inserts followed by a resolution is atomic with
/// respect to other writers and readers of that document.
pub struct DocumentWriter<'a> {
    tree: &'a mut DocumentTree,
    log: &'a RevisionLog,
    max_body_size: usize,
}

impl DocumentWriter<'_> {
    /// Read access to the tree.
    #[must_use]
    pub fn tree(&self) -> &DocumentTree {
        self.tree
    }

    /// Inserts one revision.
    ///
    /// If the revision id already exists in this document nothing is
    /// written and the existing sequence is returned with `duplicate` set.
    /// A new revision is stored with `is_current = false` and is available
    /// iff a body is supplied. No other revision is touched.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ParentNotFound`] if `parent` is not a revision of this document
    /// - [`CoreError::InvalidArgument`] if the body exceeds the configured limit
    /// - [`CoreError::Storage`] if the log rejects the write
    pub fn insert_revision(
        &mut self,
        revision_id: &RevisionId,
        parent: Option<Sequence>,
        deleted: bool,
        body: Option<Vec<u8>>,
    ) -> CoreResult<InsertOutcome> {
        if let Some(existing) = self.tree.revision(revision_id.as_str()) {
            return Ok(InsertOutcome {
                sequence: existing.sequence,
                duplicate: true,
            });
        }

        let depth = self.tree.depth_below(parent)?;
        if let Some(body) = &body {
            if body.len() > self.max_body_size {
                return Err(CoreError::invalid_argument(format!(
                    "body of {} bytes exceeds limit of {} bytes",
                    body.len(),
                    self.max_body_size
                )));
            }
        }

        let doc = self.tree.doc;
        let tree = &mut *self.tree;
        let sequence = self.log.append_sequenced(
            |sequence| LogRecord::Revision {
                sequence,
                doc,
                revision_id: revision_id.as_str().to_string(),
                parent,
                deleted,
                body,
            },
            |sequence, record| {
                let body = match record {
                    LogRecord::Revision { body, .. } => body,
                    _ => None,
                };
                tree.push(
                    Revision {
                        sequence,
                        revision_id: revision_id.clone(),
                        doc_numeric_id: doc,
                        parent_sequence: parent,
                        deleted,
                        is_current: false,
                        available: body.is_some(),
                        body,
                    },
                    depth,
                );
                sequence
            },
        )?;

        debug!(
            doc = doc.as_u64(),
            revision = %revision_id,
            sequence = sequence.as_u64(),
            deleted,
            "inserted revision"
        );
        Ok(InsertOutcome {
            sequence,
            duplicate: false,
        })
    }

    /// Moves the current flag to `sequence` with a single log record.
    ///
    /// Only the conflict resolver calls this.
    pub(crate) fn set_current(&mut self, sequence: Sequence) -> CoreResult<()> {
        if self.tree.revision_by_sequence(sequence).is_none() {
            return Err(CoreError::revision_not_found(
                &self.tree.external_id,
                sequence,
            ));
        }
        let previous = self.tree.current().map(|r| r.sequence);
        if previous == Some(sequence) {
            return Ok(());
        }

        self.log.append(&LogRecord::Winner {
            doc: self.tree.doc,
            previous,
            current: sequence,
        })?;
        self.tree.flip_current(sequence)?;
        Ok(())
    }
}

/// One document in the changes feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Numeric id.
    pub doc: DocNumericId,
    /// External id.
    pub document_id: String,
    /// Latest sequence of the document covered by this feed.
    pub sequence: Sequence,
    /// Ids of every leaf, deleted ones included.
    pub leaves: Vec<RevisionId>,
}

/// A page of the changes feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Documents in ascending order of `sequence`.
    pub entries: Vec<DocumentChange>,
    /// Position to resume from. Everything up to here has been reported.
    pub last_sequence: Sequence,
}

#[derive(Default)]
struct Catalog {
    lanes: HashMap<DocNumericId, Arc<Mutex<DocumentTree>>>,
    by_external: HashMap<String, DocNumericId>,
    next_doc: u64,
}

/// Durable, multi-version storage of revision trees.
pub struct RevisionStore {
    log: RevisionLog,
    catalog: RwLock<Catalog>,
    locals: RwLock<BTreeMap<String, Vec<u8>>>,
    config: StoreConfig,
}

impl RevisionStore {
    /// Opens a store on `backend`, replaying any existing log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted or the backend fails.
    pub fn open(backend: Box<dyn StorageBackend>, config: StoreConfig) -> CoreResult<Self> {
        let mut trees: HashMap<DocNumericId, DocumentTree> = HashMap::new();
        let mut by_external = HashMap::new();
        let mut locals = BTreeMap::new();
        let mut max_doc = 0u64;

        let (log, stats) = RevisionLog::open(backend, config.sync_on_write, |offset, record| {
            match record {
                LogRecord::Document { doc, external_id } => {
                    if trees.contains_key(&doc) || by_external.contains_key(&external_id) {
                        return Err(CoreError::log_corruption(
                            offset,
                            format!("document {external_id:?} registered twice"),
                        ));
                    }
                    max_doc = max_doc.max(doc.as_u64());
                    by_external.insert(external_id.clone(), doc);
                    trees.insert(doc, DocumentTree::new(doc, external_id));
                }
                LogRecord::Revision {
                    sequence,
                    doc,
                    revision_id,
                    parent,
                    deleted,
                    body,
                } => {
                    let tree = trees.get_mut(&doc).ok_or_else(|| {
                        CoreError::log_corruption(offset, format!("revision of unknown {doc}"))
                    })?;
                    if tree.revision(&revision_id).is_some() {
                        return Err(CoreError::log_corruption(
                            offset,
                            format!("revision {revision_id} stored twice"),
                        ));
                    }
                    let revision_id = RevisionId::parse(&revision_id)
                        .map_err(|e| CoreError::log_corruption(offset, e.to_string()))?;
                    let depth = tree
                        .depth_below(parent)
                        .map_err(|e| CoreError::log_corruption(offset, e.to_string()))?;
                    tree.push(
                        Revision {
                            sequence,
                            revision_id,
                            doc_numeric_id: doc,
                            parent_sequence: parent,
                            deleted,
                            is_current: false,
                            available: body.is_some(),
                            body,
                        },
                        depth,
                    );
                }
                LogRecord::Winner { doc, current, .. } => {
                    let tree = trees.get_mut(&doc).ok_or_else(|| {
                        CoreError::log_corruption(offset, format!("winner of unknown {doc}"))
                    })?;
                    tree.flip_current(current)
                        .map_err(|e| CoreError::log_corruption(offset, e.to_string()))?;
                }
                LogRecord::Local { key, value } => match value {
                    Some(value) => {
                        locals.insert(key, value);
                    }
                    None => {
                        locals.remove(&key);
                    }
                },
            }
            Ok(())
        })?;

        log_replay(&stats, trees.len());

        let catalog = Catalog {
            lanes: trees
                .into_iter()
                .map(|(doc, tree)| (doc, Arc::new(Mutex::new(tree))))
                .collect(),
            by_external,
            next_doc: max_doc + 1,
        };

        Ok(Self {
            log,
            catalog: RwLock::new(catalog),
            locals: RwLock::new(locals),
            config,
        })
    }

    /// Opens an empty, non-durable store.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(
            Box::new(InMemoryBackend::new()),
            StoreConfig::default().sync_on_write(false),
        )
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Registers a document, returning its numeric id.
    ///
    /// Idempotent: an already registered external id returns its existing
    /// numeric id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or the log rejects the write.
    pub fn create_document(&self, external_id: &str) -> CoreResult<DocNumericId> {
        if external_id.is_empty() {
            return Err(CoreError::invalid_argument("document id must not be empty"));
        }
        if let Some(doc) = self.document_numeric_id(external_id) {
            return Ok(doc);
        }

        let mut catalog = self.catalog.write();
        if let Some(&doc) = catalog.by_external.get(external_id) {
            return Ok(doc);
        }

        let doc = DocNumericId::new(catalog.next_doc);
        self.log.append(&LogRecord::Document {
            doc,
            external_id: external_id.to_string(),
        })?;
        catalog.next_doc += 1;
        catalog.by_external.insert(external_id.to_string(), doc);
        catalog.lanes.insert(
            doc,
            Arc::new(Mutex::new(DocumentTree::new(doc, external_id.to_string()))),
        );
        debug!(doc = doc.as_u64(), document = external_id, "registered document");
        Ok(doc)
    }

    /// Looks up the numeric id of a document.
    #[must_use]
    pub fn document_numeric_id(&self, external_id: &str) -> Option<DocNumericId> {
        self.catalog.read().by_external.get(external_id).copied()
    }

    /// Numeric ids of every registered document.
    #[must_use]
    pub fn document_ids(&self) -> Vec<DocNumericId> {
        let mut ids: Vec<_> = self.catalog.read().lanes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of registered documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.catalog.read().lanes.len()
    }

    fn lane(&self, doc: DocNumericId) -> CoreResult<Arc<Mutex<DocumentTree>>> {
        self.catalog
            .read()
            .lanes
            .get(&doc)
            .cloned()
            .ok_or_else(|| CoreError::document_not_found(doc))
    }

    /// Runs `f` with exclusive access to one document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] for an unknown document, or
    /// whatever `f` returns.
    pub fn with_document<T, F>(&self, doc: DocNumericId, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut DocumentWriter<'_>) -> CoreResult<T>,
    {
        let lane = self.lane(doc)?;
        let mut tree = lane.lock();
        let mut writer = DocumentWriter {
            tree: &mut *tree,
            log: &self.log,
            max_body_size: self.config.max_body_size,
        };
        f(&mut writer)
    }

    /// Runs `f` with a consistent view of one document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] for an unknown document.
    pub fn read_document<T, F>(&self, doc: DocNumericId, f: F) -> CoreResult<T>
    where
        F: FnOnce(&DocumentTree) -> T,
    {
        let lane = self.lane(doc)?;
        let tree = lane.lock();
        Ok(f(&tree))
    }

    /// Inserts one revision; see [`DocumentWriter::insert_revision`].
    pub fn insert_revision(
        &self,
        doc: DocNumericId,
        revision_id: &RevisionId,
        parent: Option<Sequence>,
        deleted: bool,
        body: Option<Vec<u8>>,
    ) -> CoreResult<InsertOutcome> {
        self.with_document(doc, |writer| {
            writer.insert_revision(revision_id, parent, deleted, body)
        })
    }

    /// Returns every leaf of the document, annotated with its depth.
    pub fn get_leaves(&self, doc: DocNumericId) -> CoreResult<Vec<Leaf>> {
        self.read_document(doc, DocumentTree::leaves)
    }

    /// Looks up a revision by id.
    pub fn get_revision(&self, doc: DocNumericId, revision_id: &str) -> CoreResult<Option<Revision>> {
        self.read_document(doc, |tree| tree.revision(revision_id).cloned())
    }

    /// Looks up a revision by sequence.
    pub fn get_revision_by_sequence(
        &self,
        doc: DocNumericId,
        sequence: Sequence,
    ) -> CoreResult<Option<Revision>> {
        self.read_document(doc, |tree| tree.revision_by_sequence(sequence).cloned())
    }

    /// Returns the winning revision, if the document has one.
    pub fn current_revision(&self, doc: DocNumericId) -> CoreResult<Option<Revision>> {
        self.read_document(doc, |tree| tree.current().cloned())
    }

    /// Revision ids from the root down to `sequence`.
    pub fn ancestry(&self, doc: DocNumericId, sequence: Sequence) -> CoreResult<Vec<RevisionId>> {
        self.read_document(doc, |tree| tree.ancestry(sequence))
    }

    /// Total number of revisions across all documents.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.lanes()
            .iter()
            .map(|lane| lane.lock().len())
            .sum()
    }

    /// Highest sequence assigned so far.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.log.last_sequence()
    }

    fn lanes(&self) -> Vec<Arc<Mutex<DocumentTree>>> {
        self.catalog.read().lanes.values().cloned().collect()
    }

    /// Documents changed after `since`, oldest change first, at most `limit`.
    ///
    /// The feed is cut at the sequence that was last assigned when the call
    /// started. Every revision at or below that point is already indexed, so
    /// resuming from `last_sequence` never skips a change.
    #[must_use]
    pub fn changes_since(&self, since: Sequence, limit: usize) -> Changes {
        let upto = self.log.last_sequence();
        let mut entries: Vec<DocumentChange> = self
            .lanes()
            .iter()
            .filter_map(|lane| {
                let tree = lane.lock();
                let sequence = tree.last_sequence_up_to(upto)?;
                (sequence > since).then(|| DocumentChange {
                    doc: tree.doc,
                    document_id: tree.external_id.clone(),
                    sequence,
                    leaves: tree
                        .leaves()
                        .into_iter()
                        .map(|leaf| leaf.revision.revision_id)
                        .collect(),
                })
            })
            .collect();
        entries.sort_by_key(|entry| entry.sequence);

        let last_sequence = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map_or(since, |entry| entry.sequence)
        } else {
            upto.max(since)
        };

        Changes {
            entries,
            last_sequence,
        }
    }

    /// Writes (or with `None`, removes) a local document.
    ///
    /// # Errors
    ///
    /// Returns an error if the log rejects the write.
    pub fn put_local(&self, key: &str, value: Option<Vec<u8>>) -> CoreResult<()> {
        let mut locals = self.locals.write();
        let record = LogRecord::Local {
            key: key.to_string(),
            value,
        };
        self.log.append(&record)?;
        if let LogRecord::Local { key, value } = record {
            match value {
                Some(value) => {
                    locals.insert(key, value);
                }
                None => {
                    locals.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Reads a local document.
    #[must_use]
    pub fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.locals.read().get(key).cloned()
    }

    /// Forces the log to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.log.sync()
    }
}

fn log_replay(stats: &ReplayStats, documents: usize) {
    if stats.records > 0 {
        info!(
            records = stats.records,
            documents,
            truncated_bytes = stats.truncated_bytes,
            "opened revision store"
        );
    }
}
