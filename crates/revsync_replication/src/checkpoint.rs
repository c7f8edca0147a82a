//! Replication checkpoints.
//!
//! A checkpoint remembers how far a job got in the source's changes feed,
//! per remote peer and direction. Checkpoints live in the local datastore as
//! non-replicated local documents, so they share its durability.

use crate::error::ReplicationResult;
use crate::protocol;
use revsync_core::Datastore;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    /// Lowercase name used in keys and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointRecord {
    peer_id: String,
    last_sequence: u64,
    session_id: String,
}

/// Reads and writes checkpoints in a datastore.
pub struct CheckpointStore<'a> {
    datastore: &'a Datastore,
}

impl<'a> CheckpointStore<'a> {
    /// Creates a checkpoint store over `datastore`.
    pub fn new(datastore: &'a Datastore) -> Self {
        Self { datastore }
    }

    /// Key of the local document holding a checkpoint.
    pub fn key(peer_id: &str, direction: Direction) -> String {
        format!("checkpoint/{direction}/{peer_id}")
    }

    /// Returns the stored position, or 0 if there is none.
    ///
    /// An unreadable checkpoint is discarded and replication restarts from
    /// the beginning of the feed.
    pub fn load(&self, peer_id: &str, direction: Direction) -> u64 {
        let key = Self::key(peer_id, direction);
        let Some(bytes) = self.datastore.get_local(&key) else {
            return 0;
        };
        match protocol::decode::<CheckpointRecord>(&bytes) {
            Ok(record) => record.last_sequence,
            Err(e) => {
                warn!(key = %key, error = %e, "discarding unreadable checkpoint");
                0
            }
        }
    }

    /// Stores a position.
    pub fn save(
        &self,
        peer_id: &str,
        direction: Direction,
        last_sequence: u64,
        session_id: &str,
    ) -> ReplicationResult<()> {
        let key = Self::key(peer_id, direction);
        let record = CheckpointRecord {
            peer_id: peer_id.to_string(),
            last_sequence,
            session_id: session_id.to_string(),
        };
        self.datastore.put_local(&key, protocol::encode(&record)?)?;
        debug!(key = %key, last_sequence, "checkpoint saved");
        Ok(())
    }

    /// Forgets a checkpoint.
    pub fn clear(&self, peer_id: &str, direction: Direction) -> ReplicationResult<()> {
        self.datastore
            .delete_local(&Self::key(peer_id, direction))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_are_per_peer_and_direction() {
        let db = Datastore::open_in_memory().unwrap();
        let checkpoints = CheckpointStore::new(&db);

        assert_eq!(checkpoints.load("server", Direction::Pull), 0);
        checkpoints.save("server", Direction::Pull, 42, "s1").unwrap();
        checkpoints.save("server", Direction::Push, 7, "s1").unwrap();

        assert_eq!(checkpoints.load("server", Direction::Pull), 42);
        assert_eq!(checkpoints.load("server", Direction::Push), 7);
        assert_eq!(checkpoints.load("other", Direction::Pull), 0);

        checkpoints.clear("server", Direction::Pull).unwrap();
        assert_eq!(checkpoints.load("server", Direction::Pull), 0);
    }

    #[test]
    fn garbled_checkpoint_restarts_from_zero() {
        let db = Datastore::open_in_memory().unwrap();
        db.put_local(&CheckpointStore::key("server", Direction::Pull), vec![0xff])
            .unwrap();
        assert_eq!(CheckpointStore::new(&db).load("server", Direction::Pull), 0);
    }

    #[test]
    fn checkpoint_writes_do_not_enter_the_changes_feed() {
        let db = Datastore::open_in_memory().unwrap();
        CheckpointStore::new(&db)
            .save("server", Direction::Pull, 3, "s1")
            .unwrap();
        assert!(db.changes(revsync_core::Sequence::ZERO, 10).entries.is_empty());
    }
}
