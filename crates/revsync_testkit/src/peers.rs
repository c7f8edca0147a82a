//! Peers for fault injection.

use parking_lot::Mutex;
use revsync_core::RemoteRevision;
use revsync_replication::protocol::{ChangesResponse, RevisionMap};
use revsync_replication::{RemotePeer, ReplicationError, ReplicationResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the error a scripted call fails with.
pub type FaultFn = Arc<dyn Fn() -> ReplicationError + Send + Sync>;

/// Which peer operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerOp {
    /// `changes`
    Changes,
    /// `revs_diff`
    RevsDiff,
    /// `fetch_revisions`
    Fetch,
    /// `upload_revisions`
    Upload,
}

#[derive(Default)]
struct Script {
    // 1-based call numbers that fail
    faults: HashMap<(PeerOp, usize), FaultFn>,
    calls: HashMap<PeerOp, usize>,
    since: Vec<u64>,
}

/// Wraps a peer, records what the job asked for and fails chosen calls.
pub struct ScriptedPeer {
    inner: Arc<dyn RemotePeer>,
    script: Mutex<Script>,
}

impl ScriptedPeer {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn RemotePeer>) -> Self {
        Self {
            inner,
            script: Mutex::new(Script::default()),
        }
    }

    /// Makes the `call`-th invocation (1-based, counted over the peer's
    /// lifetime) of `op` fail with the error built by `fault`.
    pub fn fail_call(
        &self,
        op: PeerOp,
        call: usize,
        fault: impl Fn() -> ReplicationError + Send + Sync + 'static,
    ) {
        self.script.lock().faults.insert((op, call), Arc::new(fault));
    }

    /// How many times `op` was invoked.
    pub fn calls(&self, op: PeerOp) -> usize {
        self.script.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every `since` passed to `changes`, in call order.
    pub fn since_values(&self) -> Vec<u64> {
        self.script.lock().since.clone()
    }

    fn enter(&self, op: PeerOp) -> ReplicationResult<()> {
        let mut script = self.script.lock();
        let count = script.calls.entry(op).or_insert(0);
        *count += 1;
        let call = *count;
        match script.faults.get(&(op, call)) {
            Some(fault) => Err(fault()),
            None => Ok(()),
        }
    }
}

impl RemotePeer for ScriptedPeer {
    fn peer_id(&self) -> &str {
        self.inner.peer_id()
    }

    fn changes(&self, since: u64, limit: usize) -> ReplicationResult<ChangesResponse> {
        self.script.lock().since.push(since);
        self.enter(PeerOp::Changes)?;
        self.inner.changes(since, limit)
    }

    fn revs_diff(&self, revisions: &RevisionMap) -> ReplicationResult<RevisionMap> {
        self.enter(PeerOp::RevsDiff)?;
        self.inner.revs_diff(revisions)
    }

    fn fetch_revisions(&self, wanted: &RevisionMap) -> ReplicationResult<Vec<RemoteRevision>> {
        self.enter(PeerOp::Fetch)?;
        self.inner.fetch_revisions(wanted)
    }

    fn upload_revisions(&self, revisions: Vec<RemoteRevision>) -> ReplicationResult<usize> {
        self.enter(PeerOp::Upload)?;
        self.inner.upload_revisions(revisions)
    }
}
