//! Error types for replication and the replication controller.

use crate::command::Command;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Result type for settings access.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors that can occur while replicating with a peer.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The peer did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The peer refused our credentials. Never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The peer sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding or decoding a wire message failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The local store failed.
    #[error("store error: {0}")]
    Store(#[from] revsync_core::CoreError),

    /// The job was asked to stop.
    #[error("replication stopped")]
    Stopped,

    /// The job's worker thread could not be spawned.
    #[error("failed to spawn replication worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the peer rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ReplicationError::Unauthorized(_))
    }
}

/// Errors raised by a settings store.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The backing file could not be read or written.
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be (de)serialized.
    #[error("settings encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors reported by the replication controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// An argument was rejected, e.g. binding an empty replicator set.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The controller is not in a state that allows the call.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A command failed while executing. The queue carries on.
    #[error("command {command} failed: {source}")]
    CommandFailed {
        /// The failed command.
        command: Command,
        /// What went wrong.
        #[source]
        source: Box<ControllerError>,
    },

    /// A host collaborator (trigger, keep-alive) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        /// Which collaborator.
        collaborator: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Settings could not be persisted.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// A replicator could not be started.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// The worker thread could not be spawned.
    #[error("failed to spawn controller worker: {0}")]
    Spawn(std::io::Error),
}

impl ControllerError {
    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Creates an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }

    /// Creates a collaborator error.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Wraps an execution failure of `command`.
    pub fn command_failed(command: Command, source: ControllerError) -> Self {
        Self::CommandFailed {
            command,
            source: Box::new(source),
        }
    }
}
