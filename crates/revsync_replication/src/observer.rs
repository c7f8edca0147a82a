//! Notifications from the replication controller.

use crate::command::Command;
use crate::error::ControllerError;
use crate::job::SessionSummary;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

/// Outcome of a replication session, as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A session finished.
    Completed {
        /// Job that ran.
        job_id: String,
        /// What it did.
        summary: SessionSummary,
    },
    /// A session failed.
    Failed {
        /// Job that ran.
        job_id: String,
        /// Description of the failure.
        message: String,
        /// Whether the peer rejected our credentials.
        unauthorized: bool,
    },
}

/// Receives controller progress.
///
/// Calls happen on the controller worker thread (or, for replication
/// events, on job threads) and must not block for long.
pub trait OperationObserver: Send + Sync {
    /// A command is about to execute.
    fn operation_started(&self, command: Command);

    /// A command failed. The controller carries on with the next one.
    fn operation_failed(&self, command: Command, error: &ControllerError) {
        let _ = (command, error);
    }

    /// A bound replicator finished or failed a session.
    fn replication_event(&self, event: &ReplicationEvent) {
        let _ = event;
    }
}

impl<F> OperationObserver for F
where
    F: Fn(Command) + Send + Sync,
{
    fn operation_started(&self, command: Command) {
        self(command);
    }
}

/// Everything an observer can see, as one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// `operation_started`.
    Started(Command),
    /// `operation_failed`, with the error rendered as text.
    Failed(Command, String),
    /// `replication_event`.
    Replication(ReplicationEvent),
}

/// An observer that forwards every notification into a channel.
pub struct ChannelObserver {
    sender: Mutex<Sender<ObserverEvent>>,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<ObserverEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn send(&self, event: ObserverEvent) {
        // a dropped receiver only means nobody is listening any more
        let _ = self.sender.lock().send(event);
    }
}

impl OperationObserver for ChannelObserver {
    fn operation_started(&self, command: Command) {
        self.send(ObserverEvent::Started(command));
    }

    fn operation_failed(&self, command: Command, error: &ControllerError) {
        self.send(ObserverEvent::Failed(command, error.to_string()));
    }

    fn replication_event(&self, event: &ReplicationEvent) {
        self.send(ObserverEvent::Replication(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closures_observe_starts() {
        let seen = AtomicUsize::new(0);
        let observer = |_: Command| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        observer.operation_started(Command::StartPeriodic);
        observer.operation_failed(
            Command::StartPeriodic,
            &ControllerError::illegal_state("unbound"),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_observer_forwards_everything() {
        let (observer, events) = ChannelObserver::new();
        observer.operation_started(Command::StopReplication);
        observer.operation_failed(
            Command::StopReplication,
            &ControllerError::collaborator("keep-alive", "lost"),
        );

        assert_eq!(
            events.recv().unwrap(),
            ObserverEvent::Started(Command::StopReplication)
        );
        match events.recv().unwrap() {
            ObserverEvent::Failed(command, message) => {
                assert_eq!(command, Command::StopReplication);
                assert!(message.contains("lost"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
