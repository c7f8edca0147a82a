//! Test fixtures and datastore helpers.

use revsync_core::{Datastore, StoreConfig};
use revsync_replication::{
    Command, ControllerConfig, ControllerServices, LocalKeepAlive, LoopbackPeer, ManualClock,
    MemorySettings, RecordingTrigger, ReplicationController, Replicator, ReplicatorConfig,
    ReplicatorJob, RetryConfig,
};
use revsync_storage::InMemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A datastore with automatic cleanup.
pub struct TestDatastore {
    /// The datastore.
    pub db: Arc<Datastore>,
    location: Option<(TempDir, PathBuf)>,
}

impl TestDatastore {
    /// Creates an in-memory datastore.
    pub fn memory() -> Self {
        Self {
            db: Arc::new(Datastore::open_in_memory().expect("failed to open in-memory datastore")),
            location: None,
        }
    }

    /// Creates a datastore backed by a file in a fresh temporary directory.
    pub fn file() -> Self {
        let dir = TempDir::new().expect("failed to create temp directory");
        let path = dir.path().join("revsync").join("revisions.log");
        let db = Datastore::open(&path, StoreConfig::default()).expect("failed to open datastore");
        Self {
            db: Arc::new(db),
            location: Some((dir, path)),
        }
    }

    /// Path of the log file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.location.as_ref().map(|(_, path)| path.as_path())
    }

    /// Closes and reopens a file-backed datastore.
    ///
    /// Panics for in-memory datastores or if other handles are still alive.
    pub fn reopen(self) -> Self {
        let Self { db, location } = self;
        let (dir, path) = location.expect("only file-backed datastores can be reopened");
        assert_eq!(Arc::strong_count(&db), 1, "datastore still shared");
        drop(db);
        let db = Datastore::open(&path, StoreConfig::default()).expect("failed to reopen datastore");
        Self {
            db: Arc::new(db),
            location: Some((dir, path)),
        }
    }
}

impl std::ops::Deref for TestDatastore {
    type Target = Datastore;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Opens a datastore over an in-memory copy of a log image.
///
/// Handy for recovery tests: copy a log file, damage the bytes, open them.
pub fn open_log_image(bytes: Vec<u8>) -> revsync_core::CoreResult<Datastore> {
    Datastore::open_with_backend(Box::new(InMemoryBackend::with_data(bytes)), StoreConfig::default())
}

/// Replication settings that keep tests fast: small batches, quick retries.
pub fn fast_replicator_config(batch_size: usize) -> ReplicatorConfig {
    ReplicatorConfig::new().with_batch_size(batch_size).with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false),
    )
}

/// Two in-memory replicas connected through a loopback peer.
pub struct ReplicaPair {
    /// The replica jobs run against.
    pub local: Arc<Datastore>,
    /// The replica behind the peer.
    pub remote: Arc<Datastore>,
}

impl ReplicaPair {
    /// Creates two empty replicas.
    pub fn new() -> Self {
        Self {
            local: Arc::new(Datastore::open_in_memory().expect("failed to open local replica")),
            remote: Arc::new(Datastore::open_in_memory().expect("failed to open remote replica")),
        }
    }

    /// A loopback peer serving the remote replica.
    pub fn peer(&self) -> Arc<LoopbackPeer> {
        Arc::new(
            LoopbackPeer::loopback("remote", Arc::clone(&self.remote))
                .configured(&fast_replicator_config(10)),
        )
    }

    /// A job pulling remote into local.
    pub fn pull(&self) -> ReplicatorJob {
        ReplicatorJob::pull(Arc::clone(&self.local), self.peer(), fast_replicator_config(10))
    }

    /// A job pushing local to remote.
    pub fn push(&self) -> ReplicatorJob {
        ReplicatorJob::push(Arc::clone(&self.local), self.peer(), fast_replicator_config(10))
    }

    /// Pushes then pulls once, after which both replicas hold the same
    /// revisions.
    pub fn sync_both_ways(&self) {
        self.push().run_once().expect("push failed");
        self.pull().run_once().expect("pull failed");
    }
}

impl Default for ReplicaPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Revision ids of every leaf of a document, sorted.
pub fn leaf_ids(db: &Datastore, document_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = db
        .leaves(document_id)
        .expect("unknown document")
        .into_iter()
        .map(|leaf| leaf.revision.revision_id.to_string())
        .collect();
    ids.sort();
    ids
}

/// Revision id of the current revision, tombstones included.
pub fn winner_id(db: &Datastore, document_id: &str) -> Option<String> {
    let doc = db.store().document_numeric_id(document_id)?;
    db.store()
        .current_revision(doc)
        .expect("failed to read document")
        .map(|revision| revision.revision_id.to_string())
}

/// Wall-clock reading the controller harness starts at.
pub const HARNESS_WALL_CLOCK_MS: i64 = 1_700_000_000_000;

/// Monotonic reading the controller harness starts at.
pub const HARNESS_MONOTONIC_MS: i64 = 60_000;

/// A controller wired to recording collaborators and a manual clock.
pub struct ControllerHarness {
    /// The controller under test.
    pub controller: ReplicationController,
    /// Settings the controller persists to.
    pub settings: Arc<MemorySettings>,
    /// Recorded trigger calls.
    pub trigger: Arc<RecordingTrigger>,
    /// Keep-alive state.
    pub keep_alive: Arc<LocalKeepAlive>,
    /// The controller's clock.
    pub clock: Arc<ManualClock>,
    /// Key names the controller uses.
    pub config: ControllerConfig,
}

impl ControllerHarness {
    /// Creates an unbound controller with empty settings.
    pub fn new() -> Self {
        Self::with_settings(Arc::new(MemorySettings::new()))
    }

    /// Creates an unbound controller over existing settings.
    pub fn with_settings(settings: Arc<MemorySettings>) -> Self {
        let config = ControllerConfig::new();
        let trigger = Arc::new(RecordingTrigger::new());
        let keep_alive = Arc::new(LocalKeepAlive::new());
        let clock = Arc::new(ManualClock::new(HARNESS_MONOTONIC_MS, HARNESS_WALL_CLOCK_MS));
        let controller = ReplicationController::new(
            config.clone(),
            ControllerServices {
                settings: settings.clone(),
                trigger: trigger.clone(),
                keep_alive: keep_alive.clone(),
                clock: clock.clone(),
            },
        );
        Self {
            controller,
            settings,
            trigger,
            keep_alive,
            clock,
            config,
        }
    }

    /// Binds the given replicators.
    pub fn bind(&self, replicators: Vec<Arc<dyn Replicator>>) {
        self.controller.bind(replicators).expect("bind failed");
    }

    /// Enqueues `commands` and waits until all of them have executed.
    pub fn run(&self, commands: &[Command]) {
        for command in commands {
            self.controller.enqueue(*command);
        }
        self.wait_idle();
    }

    /// Waits for the queue to drain.
    pub fn wait_idle(&self) {
        assert!(
            self.controller
                .wait_until_idle(Duration::from_secs(10))
                .expect("controller not bound"),
            "controller did not go idle"
        );
    }
}

impl Default for ControllerHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_datastore_survives_reopen() {
        let store = TestDatastore::file();
        assert!(store.path().is_some());
        store.create_document("a", b"1".to_vec()).unwrap();

        let store = store.reopen();
        assert_eq!(store.get_document("a").unwrap().unwrap().body, Some(b"1".to_vec()));
    }

    #[test]
    fn replica_pair_syncs() {
        let pair = ReplicaPair::new();
        pair.local.create_document("mine", b"l".to_vec()).unwrap();
        pair.remote.create_document("theirs", b"r".to_vec()).unwrap();
        pair.sync_both_ways();

        assert_eq!(pair.local.document_count(), 2);
        assert_eq!(pair.remote.document_count(), 2);
        assert_eq!(leaf_ids(&pair.local, "mine"), leaf_ids(&pair.remote, "mine"));
        assert_eq!(winner_id(&pair.local, "theirs"), winner_id(&pair.remote, "theirs"));
    }
}
