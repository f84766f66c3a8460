use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Child;

use crate::{ExitStatus, ProcessHandle, ProcessId};

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    ProcessStarted { id: ProcessId, pid: u32, command: String },
    ProcessExited { id: ProcessId, pid: u32, status: Option<ExitStatus> },
    ProcessRestarting { id: ProcessId, restart_count: u32, delay: Duration },
    ProcessRestarted { old: ProcessId, new: ProcessId },
    ProcessRemoved { id: ProcessId, pid: u32 },
    ShutdownStarted,
    ShutdownCompleted,
}

/// Outcome of a termination attempt that did not hit an OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process (and its group or tree) was signalled and is gone.
    Terminated,
    /// Nothing was left to signal.
    AlreadyGone,
    /// Every escalation step ran and the process still exists.
    StillAlive,
}

impl Termination {
    pub fn is_gone(self) -> bool {
        !matches!(self, Self::StillAlive)
    }
}

/// Platform seam: spawning into a fresh process group, tree termination and
/// the liveness probe.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawns `command` in its own process group (POSIX) or with a new
    /// process group creation flag (Windows).
    fn spawn(&self, command: &str, args: &[String]) -> crate::Result<Child>;

    /// Terminates the process and its descendants, graceful first.
    async fn terminate(&self, handle: &ProcessHandle) -> crate::Result<Termination>;

    /// Zero-effect existence check.
    fn is_alive(&self, pid: u32) -> bool;
}
