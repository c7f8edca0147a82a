//! Property-based test generators using proptest.

use proptest::prelude::*;
use revsync_core::RemoteRevision;

/// Strategy for document ids.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("invalid regex")
}

/// Strategy for revision tokens: short lowercase hex, so ties are common.
pub fn token_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[0-9a-f]{1,4}").expect("invalid regex")
}

/// Strategy for well-formed revision ids.
pub fn revision_id_strategy() -> impl Strategy<Value = String> {
    (1u64..20, token_strategy()).prop_map(|(generation, token)| format!("{generation}-{token}"))
}

/// Strategy for document bodies.
pub fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for a family of branches of one document sharing a root.
///
/// Each branch is a linear history starting at `1-root`. A token extends its
/// parent's token, so an id always sits under the same parent no matter
/// which branch carries it, the way content-derived ids behave. Branches
/// often share prefixes, so merging them exercises stubs and duplicates.
pub fn branching_history_strategy(
    document_id: &'static str,
) -> impl Strategy<Value = Vec<RemoteRevision>> {
    let step = prop::sample::select(vec!['a', 'b', 'c']);
    prop::collection::vec(
        (prop::collection::vec(step, 0..5), any::<bool>(), body_strategy()),
        1..6,
    )
    .prop_map(move |branches| {
        branches
            .into_iter()
            .map(|(steps, deleted, body)| {
                let mut history = vec!["1-root".to_string()];
                let mut path = String::new();
                for (i, step) in steps.into_iter().enumerate() {
                    path.push(step);
                    history.push(format!("{}-{path}", i + 2));
                }
                RemoteRevision {
                    document_id: document_id.to_string(),
                    history,
                    deleted,
                    body: Some(body),
                }
            })
            .collect()
    })
}

/// A local edit applied by a test script.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create (or revive) a document.
    Create {
        /// Document id.
        document_id: String,
        /// Body.
        body: Vec<u8>,
    },
    /// Update the current revision of a document.
    Update {
        /// Document id.
        document_id: String,
        /// Body.
        body: Vec<u8>,
    },
    /// Delete the current revision of a document.
    Delete {
        /// Document id.
        document_id: String,
    },
}

/// Strategy for a script of local edits over a handful of documents.
pub fn edit_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<Edit>> {
    let document_id = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string);
    let edit = prop_oneof![
        (document_id.clone(), body_strategy())
            .prop_map(|(document_id, body)| Edit::Create { document_id, body }),
        (document_id.clone(), body_strategy())
            .prop_map(|(document_id, body)| Edit::Update { document_id, body }),
        document_id.prop_map(|document_id| Edit::Delete { document_id }),
    ];
    prop::collection::vec(edit, 0..max_len)
}

/// Applies an edit to a datastore, ignoring edits that do not apply (for
/// example updating a document that does not exist).
pub fn apply_edit(db: &revsync_core::Datastore, edit: &Edit) {
    match edit {
        Edit::Create { document_id, body } => {
            let _ = db.create_document(document_id, body.clone());
        }
        Edit::Update { document_id, body } => {
            if let Ok(Some(current)) = db.get_document(document_id) {
                let _ = db.update_document(document_id, current.revision_id.as_str(), body.clone());
            }
        }
        Edit::Delete { document_id } => {
            if let Ok(Some(current)) = db.get_document(document_id) {
                let _ = db.delete_document(document_id, current.revision_id.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsync_core::RevisionId;

    proptest! {
        #[test]
        fn generated_revision_ids_parse(id in revision_id_strategy()) {
            prop_assert!(RevisionId::parse(&id).is_ok());
        }

        #[test]
        fn branches_start_at_root(branches in branching_history_strategy("doc")) {
            for branch in &branches {
                prop_assert_eq!(branch.history[0].as_str(), "1-root");
                prop_assert_eq!(branch.history.len() as u64, RevisionId::parse(branch.revision_id().unwrap()).unwrap().generation());
            }
        }
    }
}
