//! Next-due-time arithmetic for periodic replication.

use crate::clock::Clock;

/// A point in time expressed in both clock domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueTime {
    /// Monotonic milliseconds.
    pub monotonic_ms: i64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub wall_clock_ms: i64,
}

impl DueTime {
    /// The current time.
    pub fn now(clock: &dyn Clock) -> Self {
        Self {
            monotonic_ms: clock.monotonic_millis(),
            wall_clock_ms: clock.wall_clock_millis(),
        }
    }

    /// One interval from now.
    pub fn after(clock: &dyn Clock, interval_secs: u64) -> Self {
        let interval = interval_millis(interval_secs);
        let now = Self::now(clock);
        Self {
            monotonic_ms: now.monotonic_ms.saturating_add(interval),
            wall_clock_ms: now.wall_clock_ms.saturating_add(interval),
        }
    }
}

/// Outcome of reconciling a stored due time after a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The due time had passed; replication is due now.
    Elapsed(DueTime),
    /// The due time is at most one interval away and stays as it was. Only
    /// the monotonic reading is recomputed for the new boot.
    Unchanged(DueTime),
    /// The due time was more than one interval away, so the clock must
    /// have moved; replication is rescheduled one interval from now.
    Rescheduled(DueTime),
}

impl Reconciled {
    /// The reconciled due time.
    pub fn due(&self) -> DueTime {
        match *self {
            Reconciled::Elapsed(due) | Reconciled::Unchanged(due) | Reconciled::Rescheduled(due) => {
                due
            }
        }
    }

    /// Returns true if the due time must be written back.
    pub fn needs_persist(&self) -> bool {
        !matches!(self, Reconciled::Unchanged(_))
    }
}

/// Recomputes the due time after the monotonic clock restarted.
///
/// Only the wall-clock reading survives a reboot, so it decides.
pub fn reconcile_after_reboot(
    stored_wall_clock_ms: i64,
    clock: &dyn Clock,
    interval_secs: u64,
) -> Reconciled {
    let now = DueTime::now(clock);
    let remaining = stored_wall_clock_ms.saturating_sub(now.wall_clock_ms);
    if remaining <= 0 {
        Reconciled::Elapsed(now)
    } else if remaining <= interval_millis(interval_secs) {
        Reconciled::Unchanged(DueTime {
            monotonic_ms: now.monotonic_ms.saturating_add(remaining),
            wall_clock_ms: stored_wall_clock_ms,
        })
    } else {
        Reconciled::Rescheduled(DueTime::after(clock, interval_secs))
    }
}

fn interval_millis(interval_secs: u64) -> i64 {
    i64::try_from(interval_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const NOW_WALL: i64 = 1_700_000_000_000;
    const HOUR: u64 = 3600;

    fn rebooted() -> ManualClock {
        ManualClock::new(5_000, NOW_WALL)
    }

    #[test]
    fn past_due_time_fires_now() {
        let clock = rebooted();
        let reconciled = reconcile_after_reboot(NOW_WALL - 10_000, &clock, HOUR);
        assert_eq!(
            reconciled,
            Reconciled::Elapsed(DueTime {
                monotonic_ms: 5_000,
                wall_clock_ms: NOW_WALL
            })
        );
        assert!(reconciled.needs_persist());
    }

    #[test]
    fn due_time_within_interval_is_kept() {
        let clock = rebooted();
        let reconciled = reconcile_after_reboot(NOW_WALL + 1_800_000, &clock, HOUR);
        assert!(!reconciled.needs_persist());
        assert_eq!(reconciled.due().wall_clock_ms, NOW_WALL + 1_800_000);
        assert_eq!(reconciled.due().monotonic_ms, 5_000 + 1_800_000);
    }

    #[test]
    fn far_future_due_time_is_pulled_in() {
        let clock = rebooted();
        let reconciled = reconcile_after_reboot(NOW_WALL + 36_000_000, &clock, HOUR);
        assert_eq!(
            reconciled,
            Reconciled::Rescheduled(DueTime {
                monotonic_ms: 5_000 + 3_600_000,
                wall_clock_ms: NOW_WALL + 3_600_000
            })
        );
    }

    #[test]
    fn exactly_one_interval_away_is_kept() {
        let clock = rebooted();
        let reconciled = reconcile_after_reboot(NOW_WALL + 3_600_000, &clock, HOUR);
        assert!(matches!(reconciled, Reconciled::Unchanged(_)));
    }

    #[test]
    fn due_after_adds_interval_in_both_domains() {
        let clock = ManualClock::new(100, 200);
        assert_eq!(
            DueTime::after(&clock, 2),
            DueTime {
                monotonic_ms: 2_100,
                wall_clock_ms: 2_200
            }
        );
    }
}
