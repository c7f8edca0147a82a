//! Time sources.
//!
//! The controller keeps due times in two domains: a monotonic clock that
//! restarts at boot, and the wall clock, which survives a reboot but may be
//! adjusted by the user.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use nix::time::{clock_gettime, ClockId};

/// Source of the current time in both domains, in milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds on a clock that never goes backwards while the process
    /// or device is up.
    fn monotonic_millis(&self) -> i64;

    /// Milliseconds since the Unix epoch.
    fn wall_clock_millis(&self) -> i64;
}

/// The system clocks.
///
/// Monotonic time is read from the boot clock, so it counts from device boot
/// and includes time spent suspended. Platforms without one fall back to a
/// process-local instant.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    /// Creates a system clock.
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    fn process_millis(&self) -> i64 {
        i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const BOOT_CLOCK: ClockId = ClockId::CLOCK_BOOTTIME;

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const BOOT_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn since_boot_millis() -> Option<i64> {
    match clock_gettime(BOOT_CLOCK) {
        Ok(spec) => {
            Some(i64::from(spec.tv_sec()) * 1_000 + i64::from(spec.tv_nsec()) / 1_000_000)
        }
        Err(e) => {
            tracing::warn!(error = %e, "boot clock unavailable");
            None
        }
    }
}

#[cfg(not(unix))]
fn since_boot_millis() -> Option<i64> {
    None
}

impl Clock for SystemClock {
    fn monotonic_millis(&self) -> i64 {
        since_boot_millis().unwrap_or_else(|| self.process_millis())
    }

    fn wall_clock_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    monotonic: AtomicI64,
    wall: AtomicI64,
}

impl ManualClock {
    /// Creates a clock at the given readings.
    pub fn new(monotonic_ms: i64, wall_clock_ms: i64) -> Self {
        Self {
            monotonic: AtomicI64::new(monotonic_ms),
            wall: AtomicI64::new(wall_clock_ms),
        }
    }

    /// Moves both clocks forward.
    pub fn advance_millis(&self, millis: i64) {
        self.monotonic.fetch_add(millis, Ordering::SeqCst);
        self.wall.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the wall clock, leaving monotonic time alone.
    pub fn set_wall_clock(&self, wall_clock_ms: i64) {
        self.wall.store(wall_clock_ms, Ordering::SeqCst);
    }

    /// Simulates a reboot: monotonic time restarts at `monotonic_ms`.
    pub fn reboot(&self, monotonic_ms: i64) {
        self.monotonic.store(monotonic_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_millis(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }

    fn wall_clock_millis(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }
}
