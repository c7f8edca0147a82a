//! # RevSync Replication
//!
//! Moves revisions between RevSync datastores and decides when to do it.
//!
//! This crate provides:
//! - [`ReplicatorJob`]: pull or push sessions with checkpoints and retry
//! - [`RemotePeer`] and a CBOR wire protocol, with an in-process loopback
//! - [`ReplicationController`]: a serialized command queue that starts and
//!   stops replication, and manages periodic replication across reboots
//!
//! ## Replication
//!
//! Replication is revision-based: the source's changes feed lists changed
//! documents with their leaf revisions, the target reports which it lacks,
//! and those revisions travel with their full ancestry. Merging never loses
//! a branch; both replicas pick the same winner independently.
//!
//! ```rust
//! use std::sync::Arc;
//! use revsync_core::Datastore;
//! use revsync_replication::{LoopbackPeer, ReplicatorConfig, ReplicatorJob};
//!
//! let remote = Arc::new(Datastore::open_in_memory().unwrap());
//! remote.create_document("a", b"hello".to_vec()).unwrap();
//!
//! let local = Arc::new(Datastore::open_in_memory().unwrap());
//! let peer = Arc::new(LoopbackPeer::loopback("remote", remote));
//! let job = ReplicatorJob::pull(local.clone(), peer, ReplicatorConfig::default());
//!
//! job.run_once().unwrap();
//! assert!(local.get_document("a").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod clock;
mod collaborators;
mod command;
mod config;
mod controller;
mod error;
mod job;
mod observer;
mod peer;
pub mod protocol;
mod schedule;
mod settings;

pub use checkpoint::{CheckpointStore, Direction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{KeepAlive, LocalKeepAlive, PeriodicTrigger, RecordingTrigger, TriggerCall};
pub use command::Command;
pub use config::{
    ControllerConfig, ReplicatorConfig, RetryConfig, DEFAULT_INTERVAL_SECONDS,
    DEFAULT_SETTINGS_PREFIX,
};
pub use controller::{ControllerServices, ControllerState, ReplicationController};
pub use error::{
    ControllerError, ControllerResult, ReplicationError, ReplicationResult, SettingsError,
    SettingsResult,
};
pub use job::{
    NoopListener, ReplicationListener, Replicator, ReplicatorJob, ReplicatorState, SessionSummary,
};
pub use observer::{ChannelObserver, ObserverEvent, OperationObserver, ReplicationEvent};
pub use peer::{LoopbackClient, LoopbackPeer, PeerClient, PeerService, RemotePeer, WirePeer};
pub use schedule::{reconcile_after_reboot, DueTime, Reconciled};
pub use settings::{JsonFileSettings, MemorySettings, SettingValue, SettingsStore};
