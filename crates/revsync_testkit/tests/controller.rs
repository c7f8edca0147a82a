//! Controller scenarios against recording collaborators.

use parking_lot::Mutex;
use revsync_replication::{
    ChannelObserver, Command, ControllerConfig, DueTime, MemorySettings, ObserverEvent,
    ReplicationListener, ReplicationResult, Replicator, ReplicatorState, SettingValue,
    KeepAlive, SettingsStore, TriggerCall,
};
use revsync_testkit::prelude::*;
use std::sync::Arc;

const HOUR_MS: i64 = 3_600_000;

/// Logs every start and stop into a shared journal.
struct JournalReplicator {
    id: String,
    journal: Arc<Mutex<Vec<String>>>,
    state: Mutex<ReplicatorState>,
}

impl JournalReplicator {
    fn new(id: &str, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            state: Mutex::new(ReplicatorState::Pending),
        })
    }
}

impl Replicator for JournalReplicator {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self, _listener: Arc<dyn ReplicationListener>) -> ReplicationResult<()> {
        self.journal.lock().push(format!("start {}", self.id));
        *self.state.lock() = ReplicatorState::Started;
        Ok(())
    }

    fn stop(&self) {
        self.journal.lock().push(format!("stop {}", self.id));
        *self.state.lock() = ReplicatorState::Stopped;
    }

    fn state(&self) -> ReplicatorState {
        *self.state.lock()
    }
}

fn bound_harness(settings: Arc<MemorySettings>) -> (ControllerHarness, Arc<Mutex<Vec<String>>>) {
    let harness = ControllerHarness::with_settings(settings);
    let journal = Arc::new(Mutex::new(Vec::new()));
    harness.bind(vec![
        JournalReplicator::new("pull", &journal) as Arc<dyn Replicator>,
        JournalReplicator::new("push", &journal) as Arc<dyn Replicator>,
    ]);
    (harness, journal)
}

/// Settings holding a due time `offset_ms` away from the harness wall clock.
fn settings_due_in(offset_ms: i64) -> Arc<MemorySettings> {
    let config = ControllerConfig::new();
    let settings = Arc::new(MemorySettings::new());
    settings
        .put_i64(&config.due_wall_clock_key(), HARNESS_WALL_CLOCK_MS + offset_ms)
        .unwrap();
    // monotonic reading from before the reboot, meaningless now
    settings.put_i64(&config.due_monotonic_key(), 987_654).unwrap();
    settings.clear_writes();
    settings
}

#[test]
fn commands_before_bind_run_once_in_order() {
    let harness = ControllerHarness::new();
    let (observer, events) = ChannelObserver::new();
    harness.controller.set_operation_observer(Arc::new(observer));

    harness.controller.enqueue(Command::StartReplication);
    harness.controller.enqueue(Command::StartReplication);
    harness.controller.enqueue(Command::StopReplication);
    assert!(!harness.controller.state().bound);

    let journal = Arc::new(Mutex::new(Vec::new()));
    harness.bind(vec![JournalReplicator::new("only", &journal) as Arc<dyn Replicator>]);
    harness.wait_idle();

    assert_eq!(*journal.lock(), vec!["start only", "stop only"]);
    let started: Vec<ObserverEvent> = events.try_iter().collect();
    assert_eq!(
        started,
        vec![
            ObserverEvent::Started(Command::StartReplication),
            ObserverEvent::Started(Command::StopReplication),
        ]
    );
}

#[test]
fn dedup_only_collapses_adjacent_commands() {
    let (harness, journal) = bound_harness(Arc::new(MemorySettings::new()));
    harness.run(&[
        Command::StartReplication,
        Command::StopReplication,
        Command::StartReplication,
        Command::StopReplication,
    ]);
    assert_eq!(journal.lock().len(), 8);
    assert_eq!(harness.keep_alive.acquire_count(), 2);
    assert_eq!(harness.keep_alive.release_count(), 2);
    assert!(!harness.keep_alive.is_held());
}

#[test]
fn reboot_with_elapsed_due_time_fires_now() {
    let (harness, _) = bound_harness(settings_due_in(-10_000));
    harness.run(&[Command::DeviceRebooted]);

    let now = DueTime::now(harness.clock.as_ref());
    let due = harness.controller.state().next_due;
    assert!((due.monotonic_ms - now.monotonic_ms).abs() <= 500);
    assert!((due.wall_clock_ms - now.wall_clock_ms).abs() <= 500);

    let config = &harness.config;
    assert_eq!(
        harness.settings.writes(),
        vec![
            (config.due_monotonic_key(), SettingValue::Int(due.monotonic_ms)),
            (config.due_wall_clock_key(), SettingValue::Int(due.wall_clock_ms)),
        ]
    );
    // periodic is off, so nothing is registered
    assert!(harness.trigger.calls().is_empty());
}

#[test]
fn reboot_within_one_interval_keeps_due_time() {
    let (harness, _) = bound_harness(settings_due_in(1_800_000));
    harness.run(&[Command::DeviceRebooted]);

    let due = harness.controller.state().next_due;
    assert_eq!(due.wall_clock_ms, HARNESS_WALL_CLOCK_MS + 1_800_000);
    // the monotonic value is re-anchored on the fresh boot clock
    assert_eq!(due.monotonic_ms, HARNESS_MONOTONIC_MS + 1_800_000);
    assert!(harness.settings.writes().is_empty());
}

#[test]
fn reboot_far_in_the_future_reschedules_one_interval_out() {
    let (harness, _) = bound_harness(settings_due_in(36_000_000));
    harness.run(&[Command::DeviceRebooted]);

    let due = harness.controller.state().next_due;
    assert_eq!(due.wall_clock_ms, HARNESS_WALL_CLOCK_MS + HOUR_MS);
    assert_eq!(due.monotonic_ms, HARNESS_MONOTONIC_MS + HOUR_MS);
    assert_eq!(
        harness.settings.get_i64(&harness.config.due_wall_clock_key(), 0),
        HARNESS_WALL_CLOCK_MS + HOUR_MS
    );
    assert_eq!(harness.settings.writes().len(), 2);
}

#[test]
fn reboot_with_periodic_active_registers_reconciled_time() {
    let settings = settings_due_in(1_800_000);
    settings.put_bool(&ControllerConfig::new().periodic_active_key(), true).unwrap();
    let (harness, _) = bound_harness(settings);

    harness.run(&[Command::DeviceRebooted]);

    assert_eq!(
        harness.trigger.calls(),
        vec![TriggerCall::Register {
            interval_secs: 3600,
            due_monotonic_ms: HARNESS_MONOTONIC_MS + 1_800_000,
            due_wall_clock_ms: HARNESS_WALL_CLOCK_MS + 1_800_000,
        }]
    );
}

#[test]
fn start_periodic_twice_registers_once() {
    let (harness, _) = bound_harness(Arc::new(MemorySettings::new()));
    harness.run(&[Command::StartPeriodic]);
    harness.run(&[Command::StartPeriodic]);

    assert_eq!(harness.trigger.registrations(), 1);
    assert!(harness
        .settings
        .get_bool(&harness.config.periodic_active_key(), false));

    harness.run(&[Command::StopPeriodic, Command::StartPeriodic]);
    assert_eq!(harness.trigger.registrations(), 2);
    assert_eq!(harness.trigger.cancellations(), 1);
}

#[test]
fn periodic_flag_survives_a_new_controller() {
    let settings = Arc::new(MemorySettings::new());
    {
        let (harness, _) = bound_harness(Arc::clone(&settings));
        harness.run(&[Command::StartPeriodic]);
    }

    let (harness, _) = bound_harness(settings);
    assert!(harness.controller.state().periodic_active);
    // already active: no second registration from the new controller
    harness.run(&[Command::StartPeriodic]);
    assert!(harness.trigger.calls().is_empty());
}

#[test]
fn start_replication_schedules_next_run() {
    let (harness, journal) = bound_harness(Arc::new(MemorySettings::new()));
    harness.clock.advance_millis(5_000);
    harness.run(&[Command::StartReplication]);

    assert_eq!(*journal.lock(), vec!["start pull", "start push"]);
    let state = harness.controller.state();
    assert!(state.running);
    assert_eq!(
        state.next_due,
        DueTime {
            monotonic_ms: HARNESS_MONOTONIC_MS + 5_000 + HOUR_MS,
            wall_clock_ms: HARNESS_WALL_CLOCK_MS + 5_000 + HOUR_MS,
        }
    );
}
