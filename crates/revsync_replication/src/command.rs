//! Controller commands.

use std::fmt;

/// An intent delivered to the replication controller.
///
/// Commands carry no payload, so two commands are duplicates exactly when
/// they are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Acquire the keep-alive and start every bound replicator.
    StartReplication,
    /// Stop every bound replicator and release the keep-alive.
    StopReplication,
    /// Enable periodic replication and register the host trigger.
    StartPeriodic,
    /// Disable periodic replication and cancel the host trigger.
    StopPeriodic,
    /// Reconcile persisted due times after the device restarted.
    DeviceRebooted,
}

impl Command {
    /// Every command, in declaration order.
    pub const ALL: [Command; 5] = [
        Command::StartReplication,
        Command::StopReplication,
        Command::StartPeriodic,
        Command::StopPeriodic,
        Command::DeviceRebooted,
    ];

    /// Stable name used in logs and persisted diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Command::StartReplication => "START_REPLICATION",
            Command::StopReplication => "STOP_REPLICATION",
            Command::StartPeriodic => "START_PERIODIC",
            Command::StopPeriodic => "STOP_PERIODIC",
            Command::DeviceRebooted => "DEVICE_REBOOTED",
        }
    }

    /// Parses a name produced by [`Command::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
