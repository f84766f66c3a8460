use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;

use crate::{ExitStatus, ProcessHandle, ProcessId};

/// Launch specification, copied verbatim into every restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub auto_restart: bool,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>, auto_restart: bool) -> Self {
        Self {
            command: command.into(),
            args,
            auto_restart,
        }
    }
}

#[derive(Debug)]
struct RecordState {
    auto_restart: bool,
    running: bool,
    ended_at: Option<DateTime<Utc>>,
    restart_count: u32,
    exit_status: Option<ExitStatus>,
}

/// Bookkeeping for one supervised process instance.
///
/// Identity, launch spec and handle are fixed at creation. The mutable
/// lifecycle fields sit behind a single lock so a snapshot never observes a
/// half-applied transition.
#[derive(Debug)]
pub struct ProcessRecord {
    id: ProcessId,
    command: String,
    args: Vec<String>,
    handle: ProcessHandle,
    started_at: DateTime<Utc>,
    state: RwLock<RecordState>,
    termination: tokio::sync::Mutex<()>,
}

impl ProcessRecord {
    pub fn new(id: ProcessId, spec: ProcessSpec, handle: ProcessHandle, restart_count: u32) -> Self {
        Self {
            id,
            command: spec.command,
            args: spec.args,
            handle,
            started_at: Utc::now(),
            state: RwLock::new(RecordState {
                auto_restart: spec.auto_restart,
                running: true,
                ended_at: None,
                restart_count,
                exit_status: None,
            }),
            termination: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The launch spec with the current auto-restart flag.
    pub fn spec(&self) -> ProcessSpec {
        ProcessSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            auto_restart: self.auto_restart(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn auto_restart(&self) -> bool {
        self.state.read().auto_restart
    }

    /// Clears auto-restart and returns the previous value.
    pub fn disable_auto_restart(&self) -> bool {
        std::mem::replace(&mut self.state.write().auto_restart, false)
    }

    pub fn enable_auto_restart(&self) {
        self.state.write().auto_restart = true;
    }

    pub fn restart_count(&self) -> u32 {
        self.state.read().restart_count
    }

    /// Increments the restart counter and returns the new value.
    pub fn increment_restart_count(&self) -> u32 {
        let mut state = self.state.write();
        state.restart_count += 1;
        state.restart_count
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().ended_at
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state.read().exit_status
    }

    /// Running -> Exited. Only the watcher calls this.
    pub fn mark_exited(&self, status: Option<ExitStatus>) {
        let mut state = self.state.write();
        state.running = false;
        state.ended_at = Some(Utc::now());
        state.exit_status = status;
    }

    /// Serialises callers that want to signal this record's process.
    pub async fn lock_termination(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.termination.lock().await
    }

    pub fn snapshot(&self) -> ProcessInfo {
        let state = self.state.read();
        ProcessInfo {
            id: self.id.clone(),
            pid: self.handle.pid(),
            command: self.command.clone(),
            args: self.args.clone(),
            auto_restart: state.auto_restart,
            running: state.running,
            started_at: self.started_at,
            ended_at: state.ended_at,
            restart_count: state.restart_count,
            exit_code: state.exit_status.and_then(|s| s.code()),
        }
    }
}

/// Point-in-time copy of a [`ProcessRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub auto_restart: bool,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
}

impl ProcessInfo {
    pub fn status(&self) -> &'static str {
        if self.running { "running" } else { "stopped" }
    }

    pub fn is_active(&self) -> bool {
        self.running
    }

    pub fn uptime(&self) -> Duration {
        let end = if self.running {
            Utc::now()
        } else if let Some(ended_at) = self.ended_at {
            ended_at
        } else {
            return Duration::ZERO;
        };
        (end - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(auto_restart: bool) -> ProcessRecord {
        let (handle, _notifier) = ProcessHandle::new(1234);
        ProcessRecord::new(
            ProcessId::generate(),
            ProcessSpec::new("sleep", vec!["10".to_string()], auto_restart),
            handle,
            0,
        )
    }

    #[test]
    fn test_new_record_is_running() {
        let record = record(true);
        let info = record.snapshot();

        assert!(info.running);
        assert_eq!(info.status(), "running");
        assert_eq!(info.pid, 1234);
        assert_eq!(info.ended_at, None);
        assert_eq!(info.restart_count, 0);
        assert!(info.auto_restart);
    }

    #[test]
    fn test_mark_exited() {
        let record = record(false);
        record.mark_exited(Some(ExitStatus::new(Some(1), None)));

        let info = record.snapshot();
        assert!(!info.is_active());
        assert_eq!(info.status(), "stopped");
        assert!(info.ended_at.is_some());
        assert_eq!(info.exit_code, Some(1));
        assert!(info.uptime() >= Duration::ZERO);
    }

    #[test]
    fn test_disable_auto_restart_returns_previous() {
        let record = record(true);
        assert!(record.disable_auto_restart());
        assert!(!record.disable_auto_restart());
        assert!(!record.spec().auto_restart);
    }

    #[test]
    fn test_restart_count_increments() {
        let record = record(true);
        assert_eq!(record.increment_restart_count(), 1);
        assert_eq!(record.increment_restart_count(), 2);
        assert_eq!(record.restart_count(), 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let record = record(true);
        let before = record.snapshot();
        record.mark_exited(None);

        assert!(before.running);
        assert!(!record.snapshot().running);
    }
}
