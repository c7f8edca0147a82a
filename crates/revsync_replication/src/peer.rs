//! Remote peers.
//!
//! A [`RemotePeer`] is whatever a replication job talks to. [`WirePeer`]
//! speaks the CBOR protocol over any [`PeerClient`]; [`PeerService`] answers
//! the same protocol from a local [`Datastore`], and [`LoopbackClient`] wires
//! the two together without a network.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{
    self, ChangesRequest, ChangesResponse, FetchRequest, FetchResponse, RevisionMap,
    RevisionPayload, RevsDiffRequest, RevsDiffResponse, UploadRequest, UploadResponse,
    CHANGES_ENDPOINT, FETCH_ENDPOINT, REVS_DIFF_ENDPOINT, UPLOAD_ENDPOINT,
};
use revsync_core::{Datastore, RemoteRevision, Sequence};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The other side of a replication.
pub trait RemotePeer: Send + Sync {
    /// Stable identifier, used to key checkpoints.
    fn peer_id(&self) -> &str;

    /// Returns documents changed after `since`.
    fn changes(&self, since: u64, limit: usize) -> ReplicationResult<ChangesResponse>;

    /// Returns the revisions from `revisions` the peer does not hold.
    fn revs_diff(&self, revisions: &RevisionMap) -> ReplicationResult<RevisionMap>;

    /// Returns the requested revisions with their ancestry.
    fn fetch_revisions(&self, wanted: &RevisionMap) -> ReplicationResult<Vec<RemoteRevision>>;

    /// Merges revisions into the peer. Returns how many were new.
    fn upload_revisions(&self, revisions: Vec<RemoteRevision>) -> ReplicationResult<usize>;
}

/// Byte transport underneath a [`WirePeer`].
///
/// Implement this over HTTP, a socket or anything else that can carry a
/// request body to an endpoint and bring back the response body.
pub trait PeerClient: Send + Sync {
    /// Posts `body` to `endpoint` and returns the response body.
    fn post(&self, endpoint: &str, body: Vec<u8>, timeout: Duration) -> ReplicationResult<Vec<u8>>;
}

/// A peer reached through the CBOR protocol.
pub struct WirePeer<C: PeerClient> {
    peer_id: String,
    client: C,
    timeout: Duration,
}

impl<C: PeerClient> WirePeer<C> {
    /// Creates a peer on top of `client`.
    pub fn new(peer_id: impl Into<String>, client: C) -> Self {
        Self {
            peer_id: peer_id.into(),
            client,
            timeout: ReplicatorConfig::default().timeout,
        }
    }

    /// Sets the per-request timeout handed to the client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Takes the request timeout from a job configuration.
    pub fn configured(self, config: &ReplicatorConfig) -> Self {
        self.with_timeout(config.timeout)
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn call<Req, Res>(&self, endpoint: &str, request: &Req) -> ReplicationResult<Res>
    where
        Req: serde::Serialize,
        Res: serde::de::DeserializeOwned,
    {
        let body = protocol::encode(request)?;
        let response = self.client.post(endpoint, body, self.timeout)?;
        protocol::decode(&response)
    }
}

impl<C: PeerClient> RemotePeer for WirePeer<C> {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn changes(&self, since: u64, limit: usize) -> ReplicationResult<ChangesResponse> {
        let request = ChangesRequest {
            since,
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
        };
        self.call(CHANGES_ENDPOINT, &request)
    }

    fn revs_diff(&self, revisions: &RevisionMap) -> ReplicationResult<RevisionMap> {
        let request = RevsDiffRequest {
            revisions: revisions.clone(),
        };
        let response: RevsDiffResponse = self.call(REVS_DIFF_ENDPOINT, &request)?;
        Ok(response.missing)
    }

    fn fetch_revisions(&self, wanted: &RevisionMap) -> ReplicationResult<Vec<RemoteRevision>> {
        let request = FetchRequest {
            revisions: wanted.clone(),
        };
        let response: FetchResponse = self.call(FETCH_ENDPOINT, &request)?;
        Ok(response.revisions.into_iter().map(RemoteRevision::from).collect())
    }

    fn upload_revisions(&self, revisions: Vec<RemoteRevision>) -> ReplicationResult<usize> {
        let request = UploadRequest {
            revisions: revisions.into_iter().map(RevisionPayload::from).collect(),
        };
        let response: UploadResponse = self.call(UPLOAD_ENDPOINT, &request)?;
        usize::try_from(response.accepted)
            .map_err(|_| ReplicationError::Protocol("accepted count out of range".into()))
    }
}

/// Answers protocol requests from a local datastore.
#[derive(Clone)]
pub struct PeerService {
    datastore: Arc<Datastore>,
}

impl PeerService {
    /// Serves `datastore`.
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self { datastore }
    }

    /// The served datastore.
    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    /// Handles one encoded request and returns the encoded response.
    pub fn handle(&self, endpoint: &str, body: &[u8]) -> ReplicationResult<Vec<u8>> {
        debug!(endpoint, bytes = body.len(), "handling peer request");
        match endpoint {
            CHANGES_ENDPOINT => {
                let request: ChangesRequest = protocol::decode(body)?;
                let limit = usize::try_from(request.limit).unwrap_or(usize::MAX);
                let changes = self.datastore.changes(Sequence::new(request.since), limit);
                protocol::encode(&ChangesResponse::from(changes))
            }
            REVS_DIFF_ENDPOINT => {
                let request: RevsDiffRequest = protocol::decode(body)?;
                let missing = self.datastore.revs_diff(&request.revisions)?;
                protocol::encode(&RevsDiffResponse { missing })
            }
            FETCH_ENDPOINT => {
                let request: FetchRequest = protocol::decode(body)?;
                let mut revisions = Vec::new();
                for (document_id, revision_ids) in &request.revisions {
                    for revision_id in revision_ids {
                        if let Some(revision) =
                            self.datastore.revision_with_history(document_id, revision_id)?
                        {
                            revisions.push(RevisionPayload::from(revision));
                        }
                    }
                }
                protocol::encode(&FetchResponse { revisions })
            }
            UPLOAD_ENDPOINT => {
                let request: UploadRequest = protocol::decode(body)?;
                let accepted = self.datastore.force_insert_batch(
                    request.revisions.into_iter().map(RemoteRevision::from).collect(),
                )?;
                protocol::encode(&UploadResponse {
                    accepted: accepted as u64,
                })
            }
            other => Err(ReplicationError::Protocol(format!("unknown endpoint {other}"))),
        }
    }
}

/// A client that hands requests straight to a [`PeerService`].
#[derive(Clone)]
pub struct LoopbackClient {
    service: PeerService,
}

impl LoopbackClient {
    /// Creates a client bound to `service`.
    pub fn new(service: PeerService) -> Self {
        Self { service }
    }
}

impl PeerClient for LoopbackClient {
    fn post(&self, endpoint: &str, body: Vec<u8>, _timeout: Duration) -> ReplicationResult<Vec<u8>> {
        self.service.handle(endpoint, &body)
    }
}

/// A peer backed by another in-process datastore.
pub type LoopbackPeer = WirePeer<LoopbackClient>;

impl WirePeer<LoopbackClient> {
    /// Creates a peer that replicates with `datastore` through the wire
    /// encoding, without a network.
    pub fn loopback(peer_id: impl Into<String>, datastore: Arc<Datastore>) -> Self {
        Self::new(peer_id, LoopbackClient::new(PeerService::new(datastore)))
    }
}
