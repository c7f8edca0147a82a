//! The replication controller.
//!
//! External triggers (the host alarm, the application, a boot notification)
//! deliver [`Command`]s. The controller queues them and executes them one at
//! a time on a dedicated worker thread, in arrival order. Nothing executes
//! until [`ReplicationController::bind`] supplies the replicators to drive;
//! commands received before that simply wait.
//!
//! ```text
//! Unbound --bind--> Bound(Idle) <--START/STOP--> Bound(Running)
//! ```
//!
//! The periodic flag is independent of the running state and lives in the
//! settings store, so it survives process restarts.

use crate::clock::Clock;
use crate::collaborators::{KeepAlive, PeriodicTrigger};
use crate::command::Command;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult, ReplicationError};
use crate::job::{ReplicationListener, Replicator, SessionSummary};
use crate::observer::{OperationObserver, ReplicationEvent};
use crate::schedule::{reconcile_after_reboot, DueTime};
use crate::settings::SettingsStore;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Host services the controller drives.
#[derive(Clone)]
pub struct ControllerServices {
    /// Persistent flag and due-time storage.
    pub settings: Arc<dyn SettingsStore>,
    /// Host alarm.
    pub trigger: Arc<dyn PeriodicTrigger>,
    /// Host keep-alive.
    pub keep_alive: Arc<dyn KeepAlive>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// A point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerState {
    /// Whether replicators have been bound.
    pub bound: bool,
    /// Whether a replication started by the controller is in progress.
    pub running: bool,
    /// Whether periodic replication is enabled.
    pub periodic_active: bool,
    /// Commands waiting to execute, oldest first.
    pub pending: Vec<Command>,
    /// Whether a command is executing right now.
    pub executing: bool,
    /// Next due time of periodic replication.
    pub next_due: DueTime,
    /// Replication interval in seconds.
    pub interval_seconds: u64,
}

enum Binding {
    Unbound,
    Bound(Vec<Arc<dyn Replicator>>),
}

// sessions that end report back through the queue, so keep-alive handling
// stays on the worker thread
enum Task {
    Run(Command),
    SessionEnded,
}

struct QueueState {
    pending: VecDeque<Task>,
    binding: Binding,
    executing: bool,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
    services: ControllerServices,
    active_key: String,
    due_monotonic_key: String,
    due_wall_clock_key: String,
    interval_seconds: AtomicU64,
    running: AtomicBool,
    next_due: Mutex<DueTime>,
    observer: RwLock<Option<Arc<dyn OperationObserver>>>,
}

/// Serializes replication commands and drives the bound replicators.
pub struct ReplicationController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationController {
    /// Creates an unbound controller.
    pub fn new(config: ControllerConfig, services: ControllerServices) -> Self {
        let next_due = DueTime {
            monotonic_ms: services.settings.get_i64(&config.due_monotonic_key(), 0),
            wall_clock_ms: services.settings.get_i64(&config.due_wall_clock_key(), 0),
        };
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    binding: Binding::Unbound,
                    executing: false,
                    shutdown: false,
                }),
                wake: Condvar::new(),
                idle: Condvar::new(),
                active_key: config.periodic_active_key(),
                due_monotonic_key: config.due_monotonic_key(),
                due_wall_clock_key: config.due_wall_clock_key(),
                interval_seconds: AtomicU64::new(config.interval_seconds),
                running: AtomicBool::new(false),
                next_due: Mutex::new(next_due),
                observer: RwLock::new(None),
                services,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queues a command.
    ///
    /// A command equal to the most recently queued command that has not
    /// started yet is dropped. Commands arriving after shutdown are dropped.
    pub fn enqueue(&self, command: Command) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            warn!(command = %command, "controller shut down, command dropped");
            return;
        }
        let last_command = queue.pending.iter().rev().find_map(|task| match task {
            Task::Run(command) => Some(*command),
            Task::SessionEnded => None,
        });
        if last_command == Some(command) {
            debug!(command = %command, "duplicate of pending command dropped");
            return;
        }
        queue.pending.push_back(Task::Run(command));
        debug!(command = %command, pending = queue.pending.len(), "command queued");
        self.shared.wake.notify_one();
    }

    /// Supplies the replicators and starts executing commands.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::IllegalArgument`] if `replicators` is empty
    /// - [`ControllerError::IllegalState`] if already bound
    pub fn bind(&self, replicators: Vec<Arc<dyn Replicator>>) -> ControllerResult<()> {
        if replicators.is_empty() {
            return Err(ControllerError::illegal_argument(
                "at least one replicator is required",
            ));
        }
        let mut worker = self.worker.lock();
        {
            let mut queue = self.shared.queue.lock();
            if matches!(queue.binding, Binding::Bound(_)) {
                return Err(ControllerError::illegal_state("replicators are already bound"));
            }
            if queue.shutdown {
                return Err(ControllerError::illegal_state("controller is shut down"));
            }
            queue.binding = Binding::Bound(replicators);
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("revsync-controller".into())
            .spawn(move || shared.run_worker())
        {
            Ok(handle) => {
                *worker = Some(handle);
                info!("replication controller bound");
                Ok(())
            }
            Err(e) => {
                self.shared.queue.lock().binding = Binding::Unbound;
                Err(ControllerError::Spawn(e))
            }
        }
    }

    /// Blocks until the queue is empty and no command is executing, or
    /// `timeout` elapses. Returns true if the controller went idle.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::IllegalState`] if no replicators are bound,
    /// since the queue could never drain.
    pub fn wait_until_idle(&self, timeout: Duration) -> ControllerResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        if matches!(queue.binding, Binding::Unbound) {
            return Err(ControllerError::illegal_state("no replicators bound"));
        }
        while !queue.pending.is_empty() || queue.executing {
            if queue.shutdown && !queue.executing {
                break;
            }
            if self.shared.idle.wait_until(&mut queue, deadline).timed_out() {
                return Ok(queue.pending.is_empty() && !queue.executing);
            }
        }
        Ok(true)
    }

    /// A snapshot of the controller's state.
    pub fn state(&self) -> ControllerState {
        let (bound, pending, executing) = {
            let queue = self.shared.queue.lock();
            (
                matches!(queue.binding, Binding::Bound(_)),
                queue
                    .pending
                    .iter()
                    .filter_map(|task| match task {
                        Task::Run(command) => Some(*command),
                        Task::SessionEnded => None,
                    })
                    .collect(),
                queue.executing,
            )
        };
        ControllerState {
            bound,
            running: self.shared.running.load(Ordering::SeqCst),
            periodic_active: self.shared.periodic_active(),
            pending,
            executing,
            next_due: *self.shared.next_due.lock(),
            interval_seconds: self.interval_seconds(),
        }
    }

    /// Changes the replication interval. Takes effect at the next due-time
    /// computation.
    pub fn set_interval_seconds(&self, seconds: u64) {
        self.shared.interval_seconds.store(seconds, Ordering::SeqCst);
    }

    /// Current replication interval in seconds.
    pub fn interval_seconds(&self) -> u64 {
        self.shared.interval_seconds.load(Ordering::SeqCst)
    }

    /// Installs the observer, replacing any previous one.
    pub fn set_operation_observer(&self, observer: Arc<dyn OperationObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    /// Stops the worker after the command in progress. Queued commands are
    /// dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            self.shared.wake.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("replication controller worker panicked");
            }
        }
        info!("replication controller shut down");
    }
}

impl Drop for ReplicationController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run_worker(self: Arc<Self>) {
        debug!("replication controller worker started");
        loop {
            let (task, replicators) = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.shutdown {
                        if !queue.pending.is_empty() {
                            warn!(
                                dropped = queue.pending.len(),
                                "dropping queued commands on shutdown"
                            );
                            queue.pending.clear();
                        }
                        self.idle.notify_all();
                        return;
                    }
                    if let Some(task) = queue.pending.pop_front() {
                        let replicators = match &queue.binding {
                            Binding::Bound(replicators) => replicators.clone(),
                            Binding::Unbound => Vec::new(),
                        };
                        queue.executing = true;
                        break (task, replicators);
                    }
                    self.idle.notify_all();
                    self.wake.wait(&mut queue);
                }
            };

            match task {
                Task::Run(command) => self.execute(command, &replicators),
                Task::SessionEnded => self.session_ended(&replicators),
            }

            let mut queue = self.queue.lock();
            queue.executing = false;
            if queue.pending.is_empty() {
                self.idle.notify_all();
            }
        }
    }

    fn observer(&self) -> Option<Arc<dyn OperationObserver>> {
        self.observer.read().clone()
    }

    fn interval(&self) -> u64 {
        self.interval_seconds.load(Ordering::SeqCst)
    }

    fn periodic_active(&self) -> bool {
        self.services.settings.get_bool(&self.active_key, false)
    }

    fn execute(self: &Arc<Self>, command: Command, replicators: &[Arc<dyn Replicator>]) {
        if let Some(observer) = self.observer() {
            observer.operation_started(command);
        }
        info!(command = %command, "executing command");

        let result = match command {
            Command::StartReplication => self.start_replication(replicators),
            Command::StopReplication => self.stop_replication(replicators),
            Command::StartPeriodic => self.start_periodic(),
            Command::StopPeriodic => self.stop_periodic(),
            Command::DeviceRebooted => self.device_rebooted(),
        };

        if let Err(e) = result {
            let failure = ControllerError::command_failed(command, e);
            error!(command = %command, error = %failure, "command failed");
            if let Some(observer) = self.observer() {
                observer.operation_failed(command, &failure);
            }
        }
    }

    fn start_replication(self: &Arc<Self>, replicators: &[Arc<dyn Replicator>]) -> ControllerResult<()> {
        let keep_alive = &self.services.keep_alive;
        if !keep_alive.is_held() {
            keep_alive.acquire()?;
        }

        let listener: Arc<dyn ReplicationListener> = Arc::new(ListenerBridge {
            shared: Arc::clone(self),
        });
        self.running.store(true, Ordering::SeqCst);
        let mut first_error = None;
        for replicator in replicators {
            if let Err(e) = replicator.start(Arc::clone(&listener)) {
                error!(job = replicator.id(), error = %e, "failed to start replicator");
                first_error.get_or_insert(e);
            }
        }

        let due = DueTime::after(self.services.clock.as_ref(), self.interval());
        self.persist_due(due)?;
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn stop_replication(&self, replicators: &[Arc<dyn Replicator>]) -> ControllerResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("replication not running, nothing to stop");
            return Ok(());
        }
        for replicator in replicators {
            replicator.stop();
        }
        if self.services.keep_alive.is_held() {
            self.services.keep_alive.release()?;
        }
        Ok(())
    }

    fn start_periodic(&self) -> ControllerResult<()> {
        if self.periodic_active() {
            debug!("periodic replication already active");
            return Ok(());
        }

        let stored = *self.next_due.lock();
        let due = if stored.monotonic_ms > 0 {
            stored
        } else {
            let due = DueTime::after(self.services.clock.as_ref(), self.interval());
            self.persist_due(due)?;
            due
        };
        self.services
            .trigger
            .register(self.interval(), due.monotonic_ms, due.wall_clock_ms)?;
        // the flag only records a schedule the host accepted
        self.services.settings.put_bool(&self.active_key, true)?;
        info!(
            interval_seconds = self.interval(),
            due_wall_clock_ms = due.wall_clock_ms,
            "periodic replication started"
        );
        Ok(())
    }

    fn stop_periodic(&self) -> ControllerResult<()> {
        if !self.periodic_active() {
            debug!("periodic replication already inactive");
            return Ok(());
        }
        self.services.trigger.cancel()?;
        self.services.settings.put_bool(&self.active_key, false)?;
        info!("periodic replication stopped");
        Ok(())
    }

    fn device_rebooted(&self) -> ControllerResult<()> {
        let stored_wall = self.services.settings.get_i64(&self.due_wall_clock_key, 0);
        let reconciled =
            reconcile_after_reboot(stored_wall, self.services.clock.as_ref(), self.interval());
        let due = reconciled.due();
        if reconciled.needs_persist() {
            self.persist_due(due)?;
        } else {
            *self.next_due.lock() = due;
        }
        info!(?reconciled, "due time reconciled after reboot");

        if self.periodic_active() {
            self.services
                .trigger
                .register(self.interval(), due.monotonic_ms, due.wall_clock_ms)?;
        }
        Ok(())
    }

    fn persist_due(&self, due: DueTime) -> ControllerResult<()> {
        *self.next_due.lock() = due;
        let settings = &self.services.settings;
        settings.put_i64(&self.due_monotonic_key, due.monotonic_ms)?;
        settings.put_i64(&self.due_wall_clock_key, due.wall_clock_ms)?;
        Ok(())
    }

    fn session_ended(&self, replicators: &[Arc<dyn Replicator>]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if replicators.iter().any(|r| r.state().is_active()) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if self.services.keep_alive.is_held() {
            if let Err(e) = self.services.keep_alive.release() {
                warn!(error = %e, "failed to release keep-alive");
            }
        }
        info!("all replications finished");
    }

    fn report(&self, event: ReplicationEvent) {
        if let Some(observer) = self.observer() {
            observer.replication_event(&event);
        }
        let mut queue = self.queue.lock();
        if !queue.shutdown {
            queue.pending.push_back(Task::SessionEnded);
            self.wake.notify_one();
        }
    }
}

struct ListenerBridge {
    shared: Arc<Shared>,
}

impl ReplicationListener for ListenerBridge {
    fn complete(&self, job_id: &str, summary: &SessionSummary) {
        self.shared.report(ReplicationEvent::Completed {
            job_id: job_id.to_string(),
            summary: summary.clone(),
        });
    }

    fn error(&self, job_id: &str, error: &ReplicationError) {
        if error.is_unauthorized() {
            warn!(job = job_id, error = %error, "peer rejected credentials");
        }
        self.shared.report(ReplicationEvent::Failed {
            job_id: job_id.to_string(),
            message: error.to_string(),
            unauthorized: error.is_unauthorized(),
        });
    }
}
