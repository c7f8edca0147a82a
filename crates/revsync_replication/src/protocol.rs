//! Wire messages exchanged between replicas.
//!
//! Every request and response is a serde struct encoded as CBOR. Revision
//! bodies travel as opaque bytes together with their full ancestry.

use crate::error::{ReplicationError, ReplicationResult};
use revsync_core::{Changes, RemoteRevision};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Endpoint serving the changes feed.
pub const CHANGES_ENDPOINT: &str = "/revsync/changes";
/// Endpoint answering revision diffs.
pub const REVS_DIFF_ENDPOINT: &str = "/revsync/revs_diff";
/// Endpoint returning revisions with their history.
pub const FETCH_ENDPOINT: &str = "/revsync/fetch";
/// Endpoint accepting revisions from a peer.
pub const UPLOAD_ENDPOINT: &str = "/revsync/upload";

/// Revision ids keyed by document id.
pub type RevisionMap = BTreeMap<String, Vec<String>>;

/// Request for a page of the changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Exclusive lower bound.
    pub since: u64,
    /// Maximum number of rows.
    pub limit: u32,
}

/// One changed document in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// External document id.
    pub document_id: String,
    /// Latest sequence of the document in this page.
    pub sequence: u64,
    /// Every leaf revision id of the document.
    pub leaves: Vec<String>,
}

/// A page of the changes feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changed documents, oldest change first.
    pub results: Vec<ChangeRow>,
    /// Position to resume from.
    pub last_sequence: u64,
}

impl ChangesResponse {
    /// Leaf revision ids of every row, keyed by document.
    pub fn leaf_map(&self) -> RevisionMap {
        let mut map = RevisionMap::new();
        for row in &self.results {
            map.entry(row.document_id.clone())
                .or_default()
                .extend(row.leaves.iter().cloned());
        }
        map
    }
}

impl From<Changes> for ChangesResponse {
    fn from(changes: Changes) -> Self {
        Self {
            results: changes
                .entries
                .into_iter()
                .map(|entry| ChangeRow {
                    document_id: entry.document_id,
                    sequence: entry.sequence.as_u64(),
                    leaves: entry.leaves.iter().map(ToString::to_string).collect(),
                })
                .collect(),
            last_sequence: changes.last_sequence.as_u64(),
        }
    }
}

/// Asks which of the listed revisions the receiver is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffRequest {
    /// Candidate revision ids per document.
    pub revisions: RevisionMap,
}

/// Revisions the receiver does not have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffResponse {
    /// Missing revision ids per document.
    pub missing: RevisionMap,
}

/// Requests revisions together with their ancestry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Wanted revision ids per document.
    pub revisions: RevisionMap,
}

/// A revision with its history, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPayload {
    /// External document id.
    pub document_id: String,
    /// Revision ids from the oldest known ancestor to this revision.
    pub history: Vec<String>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Content, absent for stubs.
    pub body: Option<Vec<u8>>,
}

impl From<RemoteRevision> for RevisionPayload {
    fn from(revision: RemoteRevision) -> Self {
        Self {
            document_id: revision.document_id,
            history: revision.history,
            deleted: revision.deleted,
            body: revision.body,
        }
    }
}

impl From<RevisionPayload> for RemoteRevision {
    fn from(payload: RevisionPayload) -> Self {
        Self {
            document_id: payload.document_id,
            history: payload.history,
            deleted: payload.deleted,
            body: payload.body,
        }
    }
}

/// Fetched revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Requested revisions the sender holds.
    pub revisions: Vec<RevisionPayload>,
}

/// Pushes revisions to the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Revisions to merge.
    pub revisions: Vec<RevisionPayload>,
}

/// Result of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Number of revisions that were new to the receiver.
    pub accepted: u64,
}

/// Encodes a message as CBOR.
pub fn encode<T: Serialize>(message: &T) -> ReplicationResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf)
        .map_err(|e| ReplicationError::Codec(format!("failed to encode message: {e}")))?;
    Ok(buf)
}

/// Decodes a CBOR message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ReplicationResult<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| ReplicationError::Codec(format!("failed to decode message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsync_core::Datastore;

    #[test]
    fn changes_page_converts_from_store_feed() {
        let db = Datastore::open_in_memory().unwrap();
        let a = db.create_document("a", b"1".to_vec()).unwrap();
        db.create_document("b", b"2".to_vec()).unwrap();

        let page = ChangesResponse::from(db.changes(revsync_core::Sequence::ZERO, 10));
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].document_id, "a");
        assert_eq!(page.results[0].leaves, vec![a.revision_id.to_string()]);
        assert_eq!(page.last_sequence, db.last_sequence().as_u64());

        let leaves = page.leaf_map();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.contains_key("b"));
    }

    #[test]
    fn upload_survives_the_wire() {
        let request = UploadRequest {
            revisions: vec![RevisionPayload {
                document_id: "doc".into(),
                history: vec!["1-a".into(), "2-b".into()],
                deleted: false,
                body: Some(vec![0, 159, 255]),
            }],
        };
        let decoded: UploadRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: ReplicationResult<ChangesResponse> = decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ReplicationError::Codec(_))));
    }
}
