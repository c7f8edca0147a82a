//! Replication jobs.
//!
//! A [`ReplicatorJob`] moves revisions one way between the local datastore
//! and a [`RemotePeer`]. A session walks the source's changes feed in
//! batches:
//!
//! 1. read a page of changed documents and their leaf revision ids
//! 2. ask the target which of those revisions it is missing
//! 3. transfer the missing revisions with their ancestry and merge them
//! 4. store the page's position as the checkpoint
//!
//! The checkpoint is written only after a batch is merged, so a session
//! that fails or is stopped resumes exactly after the last applied batch.

use crate::checkpoint::{CheckpointStore, Direction};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::peer::RemotePeer;
use crate::protocol::{ChangesResponse, RevisionMap};
use parking_lot::{Mutex, RwLock};
use revsync_core::{Datastore, Sequence};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a replication job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Never started.
    Pending,
    /// A session is running.
    Started,
    /// Stop was requested; the session ends after the current batch.
    Stopping,
    /// The last session was stopped before it finished.
    Stopped,
    /// The last session reached the end of the feed.
    Complete,
    /// The last session failed.
    Error,
}

impl ReplicatorState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        matches!(self, ReplicatorState::Started | ReplicatorState::Stopping)
    }
}

/// Outcome of one replication session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session identifier, stored with each checkpoint.
    pub session_id: String,
    /// Number of batches applied.
    pub batches: u64,
    /// Number of revisions that were new to the target.
    pub revisions_transferred: u64,
    /// Checkpoint position when the session ended.
    pub last_sequence: u64,
    /// Whether the session ended because stop was requested.
    pub stopped: bool,
}

/// Receives the outcome of asynchronously started sessions.
pub trait ReplicationListener: Send + Sync {
    /// A session finished, either at the end of the feed or after a stop.
    fn complete(&self, job_id: &str, summary: &SessionSummary);

    /// A session failed.
    fn error(&self, job_id: &str, error: &ReplicationError);
}

/// A listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ReplicationListener for NoopListener {
    fn complete(&self, _job_id: &str, _summary: &SessionSummary) {}

    fn error(&self, _job_id: &str, _error: &ReplicationError) {}
}

/// Something the replication controller can start and stop.
pub trait Replicator: Send + Sync {
    /// Identifier used in logs and events.
    fn id(&self) -> &str;

    /// Starts a session in the background. A running job ignores the call.
    fn start(&self, listener: Arc<dyn ReplicationListener>) -> ReplicationResult<()>;

    /// Asks a running session to stop after its current batch.
    fn stop(&self);

    /// Current state.
    fn state(&self) -> ReplicatorState;
}

struct JobInner {
    id: String,
    direction: Direction,
    local: Arc<Datastore>,
    peer: Arc<dyn RemotePeer>,
    config: ReplicatorConfig,
    state: RwLock<ReplicatorState>,
    stop_requested: AtomicBool,
}

/// One-directional replication between the local datastore and a peer.
pub struct ReplicatorJob {
    inner: Arc<JobInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatorJob {
    /// Creates a job pulling from `peer` into `local`.
    pub fn pull(local: Arc<Datastore>, peer: Arc<dyn RemotePeer>, config: ReplicatorConfig) -> Self {
        Self::new(Direction::Pull, local, peer, config)
    }

    /// Creates a job pushing from `local` to `peer`.
    pub fn push(local: Arc<Datastore>, peer: Arc<dyn RemotePeer>, config: ReplicatorConfig) -> Self {
        Self::new(Direction::Push, local, peer, config)
    }

    /// Creates a job in the given direction.
    pub fn new(
        direction: Direction,
        local: Arc<Datastore>,
        peer: Arc<dyn RemotePeer>,
        config: ReplicatorConfig,
    ) -> Self {
        let id = format!("{direction}:{}", peer.peer_id());
        Self {
            inner: Arc::new(JobInner {
                id,
                direction,
                local,
                peer,
                config,
                state: RwLock::new(ReplicatorState::Pending),
                stop_requested: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Direction of this job.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Runs one session on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. Progress up to the last
    /// applied batch is kept in the checkpoint.
    pub fn run_once(&self) -> ReplicationResult<SessionSummary> {
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        *self.inner.state.write() = ReplicatorState::Started;
        self.inner.run()
    }

    /// Waits for a background session to end.
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(job = %self.inner.id, "replication worker panicked");
            }
        }
    }
}

impl Replicator for ReplicatorJob {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn start(&self, listener: Arc<dyn ReplicationListener>) -> ReplicationResult<()> {
        let mut handle = self.handle.lock();
        if *self.inner.state.read() == ReplicatorState::Started {
            debug!(job = %self.inner.id, "already running, start ignored");
            return Ok(());
        }

        // a stopping session must finish before the next one takes over
        if let Some(previous) = handle.take() {
            if previous.join().is_err() {
                error!(job = %self.inner.id, "replication worker panicked");
            }
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        *self.inner.state.write() = ReplicatorState::Started;

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("revsync-{}", self.inner.id))
            .spawn(move || match inner.run() {
                Ok(summary) => listener.complete(&inner.id, &summary),
                Err(e) => listener.error(&inner.id, &e),
            });
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                info!(job = %self.inner.id, "replication started");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.write() = ReplicatorState::Error;
                Err(ReplicationError::Spawn(e))
            }
        }
    }

    fn stop(&self) {
        let mut state = self.inner.state.write();
        if *state == ReplicatorState::Started {
            self.inner.stop_requested.store(true, Ordering::SeqCst);
            *state = ReplicatorState::Stopping;
            info!(job = %self.inner.id, "replication stop requested");
        }
    }

    fn state(&self) -> ReplicatorState {
        *self.inner.state.read()
    }
}

impl JobInner {
    fn run(&self) -> ReplicationResult<SessionSummary> {
        let result = self.session();
        let mut state = self.state.write();
        match &result {
            Ok(summary) if summary.stopped => {
                *state = ReplicatorState::Stopped;
                info!(job = %self.id, batches = summary.batches, "replication stopped");
            }
            Ok(summary) => {
                *state = ReplicatorState::Complete;
                info!(
                    job = %self.id,
                    batches = summary.batches,
                    revisions = summary.revisions_transferred,
                    last_sequence = summary.last_sequence,
                    "replication complete"
                );
            }
            Err(e) => {
                *state = ReplicatorState::Error;
                error!(job = %self.id, error = %e, "replication failed");
            }
        }
        result
    }

    fn session(&self) -> ReplicationResult<SessionSummary> {
        let checkpoints = CheckpointStore::new(&self.local);
        let mut summary = SessionSummary {
            session_id: Uuid::new_v4().simple().to_string(),
            last_sequence: checkpoints.load(self.peer.peer_id(), self.direction),
            ..SessionSummary::default()
        };
        debug!(job = %self.id, since = summary.last_sequence, "session begins");

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                summary.stopped = true;
                return Ok(summary);
            }

            let since = summary.last_sequence;
            let page = match self.direction {
                Direction::Pull => {
                    self.with_retry("changes", || self.peer.changes(since, self.config.batch_size))?
                }
                Direction::Push => ChangesResponse::from(
                    self.local.changes(Sequence::new(since), self.config.batch_size),
                ),
            };
            if page.results.is_empty() {
                if page.last_sequence > since {
                    checkpoints.save(
                        self.peer.peer_id(),
                        self.direction,
                        page.last_sequence,
                        &summary.session_id,
                    )?;
                    summary.last_sequence = page.last_sequence;
                }
                return Ok(summary);
            }
            if page.last_sequence <= since {
                return Err(ReplicationError::Protocol(format!(
                    "changes feed did not advance past {since}"
                )));
            }

            let transferred = match self.direction {
                Direction::Pull => self.pull_batch(&page)?,
                Direction::Push => self.push_batch(&page)?,
            };
            checkpoints.save(
                self.peer.peer_id(),
                self.direction,
                page.last_sequence,
                &summary.session_id,
            )?;
            summary.batches += 1;
            summary.revisions_transferred += transferred as u64;
            summary.last_sequence = page.last_sequence;
            debug!(
                job = %self.id,
                documents = page.results.len(),
                transferred,
                last_sequence = page.last_sequence,
                "batch applied"
            );

            if page.results.len() < self.config.batch_size {
                return Ok(summary);
            }
        }
    }

    fn pull_batch(&self, page: &ChangesResponse) -> ReplicationResult<usize> {
        let missing = self.local.revs_diff(&page.leaf_map())?;
        if missing.is_empty() {
            return Ok(0);
        }
        let revisions = self.with_retry("fetch", || self.peer.fetch_revisions(&missing))?;
        Ok(self.local.force_insert_batch(revisions)?)
    }

    fn push_batch(&self, page: &ChangesResponse) -> ReplicationResult<usize> {
        let wanted = page.leaf_map();
        let missing: RevisionMap = self.with_retry("revs_diff", || self.peer.revs_diff(&wanted))?;
        let mut revisions = Vec::new();
        for (document_id, revision_ids) in &missing {
            for revision_id in revision_ids {
                match self.local.revision_with_history(document_id, revision_id)? {
                    Some(revision) => revisions.push(revision),
                    None => warn!(
                        job = %self.id,
                        document = %document_id,
                        revision = %revision_id,
                        "peer asked for a revision we do not hold"
                    ),
                }
            }
        }
        if revisions.is_empty() {
            return Ok(0);
        }
        self.with_retry("upload", || self.peer.upload_revisions(revisions.clone()))
    }

    fn with_retry<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> ReplicationResult<T>,
    ) -> ReplicationResult<T> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        job = %self.id,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::peer::LoopbackPeer;
    use parking_lot::Mutex as PlMutex;
    use revsync_core::RemoteRevision;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn fast_config(batch_size: usize) -> ReplicatorConfig {
        ReplicatorConfig::new().with_batch_size(batch_size).with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn seeded(count: usize) -> Arc<Datastore> {
        let db = Arc::new(Datastore::open_in_memory().unwrap());
        for i in 0..count {
            db.create_document(&format!("doc-{i:02}"), format!("body {i}").into_bytes())
                .unwrap();
        }
        db
    }

    /// Wraps a peer and fails the first `failures` changes calls.
    struct FlakyPeer {
        inner: LoopbackPeer,
        failures: AtomicUsize,
        error: fn() -> ReplicationError,
        calls: AtomicUsize,
    }

    impl RemotePeer for FlakyPeer {
        fn peer_id(&self) -> &str {
            self.inner.peer_id()
        }

        fn changes(&self, since: u64, limit: usize) -> ReplicationResult<ChangesResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err((self.error)());
            }
            self.inner.changes(since, limit)
        }

        fn revs_diff(&self, revisions: &RevisionMap) -> ReplicationResult<RevisionMap> {
            self.inner.revs_diff(revisions)
        }

        fn fetch_revisions(&self, wanted: &RevisionMap) -> ReplicationResult<Vec<RemoteRevision>> {
            self.inner.fetch_revisions(wanted)
        }

        fn upload_revisions(&self, revisions: Vec<RemoteRevision>) -> ReplicationResult<usize> {
            self.inner.upload_revisions(revisions)
        }
    }

    #[test]
    fn pull_copies_everything_in_batches() {
        let remote = seeded(5);
        let local = Arc::new(Datastore::open_in_memory().unwrap());
        let peer = Arc::new(LoopbackPeer::loopback("remote", Arc::clone(&remote)));
        let job = ReplicatorJob::pull(Arc::clone(&local), peer, fast_config(2));

        let summary = job.run_once().unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.revisions_transferred, 5);
        assert_eq!(summary.last_sequence, remote.last_sequence().as_u64());
        assert_eq!(job.state(), ReplicatorState::Complete);
        assert_eq!(local.document_count(), 5);

        // nothing new: the second session starts at the checkpoint
        let again = job.run_once().unwrap();
        assert_eq!(again.batches, 0);
        assert_eq!(again.revisions_transferred, 0);
    }

    #[test]
    fn push_uploads_local_changes() {
        let local = seeded(3);
        let remote = Arc::new(Datastore::open_in_memory().unwrap());
        let peer = Arc::new(LoopbackPeer::loopback("remote", Arc::clone(&remote)));
        let job = ReplicatorJob::push(Arc::clone(&local), peer, fast_config(10));

        let summary = job.run_once().unwrap();
        assert_eq!(summary.revisions_transferred, 3);
        assert_eq!(remote.document_count(), 3);
        assert_eq!(
            remote.get_document("doc-01").unwrap().unwrap().body,
            Some(b"body 1".to_vec())
        );
    }

    #[test]
    fn transient_faults_are_retried() {
        let remote = seeded(2);
        let local = Arc::new(Datastore::open_in_memory().unwrap());
        let peer = Arc::new(FlakyPeer {
            inner: LoopbackPeer::loopback("remote", remote),
            failures: AtomicUsize::new(2),
            error: || ReplicationError::transport_retryable("connection reset"),
            calls: AtomicUsize::new(0),
        });
        let job = ReplicatorJob::pull(Arc::clone(&local), peer.clone(), fast_config(10));

        job.run_once().unwrap();
        assert_eq!(local.document_count(), 2);
        assert_eq!(peer.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let peer = Arc::new(FlakyPeer {
            inner: LoopbackPeer::loopback("remote", seeded(1)),
            failures: AtomicUsize::new(10),
            error: || ReplicationError::Timeout,
            calls: AtomicUsize::new(0),
        });
        let job = ReplicatorJob::pull(
            Arc::new(Datastore::open_in_memory().unwrap()),
            peer.clone(),
            fast_config(10),
        );

        assert!(matches!(job.run_once(), Err(ReplicationError::Timeout)));
        assert_eq!(peer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.state(), ReplicatorState::Error);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let peer = Arc::new(FlakyPeer {
            inner: LoopbackPeer::loopback("remote", seeded(1)),
            failures: AtomicUsize::new(1),
            error: || ReplicationError::Unauthorized("token expired".into()),
            calls: AtomicUsize::new(0),
        });
        let job = ReplicatorJob::pull(
            Arc::new(Datastore::open_in_memory().unwrap()),
            peer.clone(),
            fast_config(10),
        );

        let err = job.run_once().unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1);
    }

    struct ChannelListener(PlMutex<mpsc::Sender<Result<SessionSummary, String>>>);

    impl ReplicationListener for ChannelListener {
        fn complete(&self, _job_id: &str, summary: &SessionSummary) {
            let _ = self.0.lock().send(Ok(summary.clone()));
        }

        fn error(&self, _job_id: &str, error: &ReplicationError) {
            let _ = self.0.lock().send(Err(error.to_string()));
        }
    }

    #[test]
    fn background_start_reports_to_listener() {
        let remote = seeded(4);
        let local = Arc::new(Datastore::open_in_memory().unwrap());
        let peer = Arc::new(LoopbackPeer::loopback("remote", remote));
        let job = ReplicatorJob::pull(Arc::clone(&local), peer, fast_config(10));
        assert_eq!(job.id(), "pull:remote");
        assert_eq!(job.state(), ReplicatorState::Pending);

        let (tx, rx) = mpsc::channel();
        job.start(Arc::new(ChannelListener(PlMutex::new(tx)))).unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        job.join();

        assert_eq!(outcome.unwrap().revisions_transferred, 4);
        assert_eq!(job.state(), ReplicatorState::Complete);
        assert_eq!(local.document_count(), 4);
    }

    #[test]
    fn stop_on_idle_job_is_a_no_op() {
        let job = ReplicatorJob::pull(
            Arc::new(Datastore::open_in_memory().unwrap()),
            Arc::new(LoopbackPeer::loopback("remote", seeded(0))),
            fast_config(10),
        );
        job.stop();
        assert_eq!(job.state(), ReplicatorState::Pending);
    }
}
