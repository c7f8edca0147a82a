//! Host facilities the controller drives but does not own.
//!
//! The host wakes the process at or after a registered due time and delivers
//! `START_REPLICATION` (or `DEVICE_REBOOTED` after a restart) back to the
//! controller. The controller never assumes exact punctuality.

use crate::error::{ControllerError, ControllerResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Host alarm that redelivers a command once the due time has passed.
pub trait PeriodicTrigger: Send + Sync {
    /// Registers (or replaces) the repeating trigger.
    fn register(
        &self,
        interval_secs: u64,
        due_monotonic_ms: i64,
        due_wall_clock_ms: i64,
    ) -> ControllerResult<()>;

    /// Cancels the trigger.
    fn cancel(&self) -> ControllerResult<()>;
}

/// Keeps the host from suspending the process while replication runs.
pub trait KeepAlive: Send + Sync {
    /// Takes the keep-alive.
    fn acquire(&self) -> ControllerResult<()>;

    /// Gives the keep-alive back.
    fn release(&self) -> ControllerResult<()>;

    /// Returns true while the keep-alive is held.
    fn is_held(&self) -> bool;
}

/// A call made on a [`RecordingTrigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCall {
    /// `register` was called.
    Register {
        /// Interval in seconds.
        interval_secs: u64,
        /// Monotonic due time.
        due_monotonic_ms: i64,
        /// Wall-clock due time.
        due_wall_clock_ms: i64,
    },
    /// `cancel` was called.
    Cancel,
}

/// A trigger that records calls instead of talking to the host.
#[derive(Debug, Default)]
pub struct RecordingTrigger {
    calls: Mutex<Vec<TriggerCall>>,
    fail: AtomicBool,
}

impl RecordingTrigger {
    /// Creates a trigger with no recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<TriggerCall> {
        self.calls.lock().clone()
    }

    /// Number of `register` calls.
    pub fn registrations(&self) -> usize {
        self.count(|call| matches!(call, TriggerCall::Register { .. }))
    }

    /// Number of `cancel` calls.
    pub fn cancellations(&self) -> usize {
        self.count(|call| matches!(call, TriggerCall::Cancel))
    }

    /// Makes subsequent calls fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn count(&self, predicate: impl Fn(&TriggerCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: TriggerCall) -> ControllerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ControllerError::collaborator(
                "periodic trigger",
                "alarm service unavailable",
            ));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl PeriodicTrigger for RecordingTrigger {
    fn register(
        &self,
        interval_secs: u64,
        due_monotonic_ms: i64,
        due_wall_clock_ms: i64,
    ) -> ControllerResult<()> {
        self.record(TriggerCall::Register {
            interval_secs,
            due_monotonic_ms,
            due_wall_clock_ms,
        })
    }

    fn cancel(&self) -> ControllerResult<()> {
        self.record(TriggerCall::Cancel)
    }
}

/// An in-process keep-alive that counts acquisitions.
#[derive(Debug, Default)]
pub struct LocalKeepAlive {
    held: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl LocalKeepAlive {
    /// Creates a keep-alive that is not held.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the keep-alive was taken.
    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// How many times the keep-alive was given back.
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl KeepAlive for LocalKeepAlive {
    fn acquire(&self) -> ControllerResult<()> {
        self.held.store(true, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> ControllerResult<()> {
        self.held.store(false, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_trigger_counts_calls() {
        let trigger = RecordingTrigger::new();
        trigger.register(60, 1_000, 2_000).unwrap();
        trigger.cancel().unwrap();
        assert_eq!(trigger.registrations(), 1);
        assert_eq!(trigger.cancellations(), 1);

        trigger.set_failing(true);
        assert!(trigger.cancel().is_err());
        assert_eq!(trigger.calls().len(), 2);
    }

    #[test]
    fn keep_alive_tracks_holding() {
        let keep_alive = LocalKeepAlive::new();
        assert!(!keep_alive.is_held());
        keep_alive.acquire().unwrap();
        assert!(keep_alive.is_held());
        keep_alive.release().unwrap();
        assert!(!keep_alive.is_held());
        assert_eq!((keep_alive.acquire_count(), keep_alive.release_count()), (1, 1));
    }
}
