use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg};
use nix::unistd::Pid;
use procvisor_core::{
    Error, ProcessBuilder, ProcessControl, ProcessHandle, Result, Signal, SupervisorConfig,
    Termination,
};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Process-group based termination: SIGTERM to the group, a grace window,
/// then SIGKILL to whatever is left.
pub struct UnixProcessControl {
    grace: Duration,
    kill_timeout: Duration,
}

impl UnixProcessControl {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            grace: config.termination_grace(),
            kill_timeout: config.kill_timeout(),
        }
    }

    fn to_pid(pid: u32) -> Result<Pid> {
        i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| Error::Supervisor(format!("PID {} is not a valid process id", pid)))
    }

    /// Children are spawned with `process_group(0)`, so the group id is the
    /// leader's pid.
    fn signal_group(pid: u32, sig: Signal) -> Result<Termination> {
        let pgid = Self::to_pid(pid)?;
        match killpg(pgid, sig.to_nix()) {
            Ok(()) => Ok(Termination::Terminated),
            Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
            Err(e) => {
                warn!(
                    "Failed to send {:?} to process group {}: {}, signalling leader only",
                    sig, pgid, e
                );
                match signal::kill(pgid, sig.to_nix()) {
                    Ok(()) => Ok(Termination::Terminated),
                    Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
                    Err(e) => Err(Error::Unix(e)),
                }
            }
        }
    }

    fn group_exists(pid: u32) -> bool {
        match Self::to_pid(pid) {
            Ok(pgid) => !matches!(killpg(pgid, None), Err(Errno::ESRCH)),
            Err(_) => false,
        }
    }

    fn leader_gone(&self, handle: &ProcessHandle) -> bool {
        handle.has_exited() || !probe_pid(handle.pid())
    }

    /// Zero-effect existence probe.
    pub fn probe(pid: u32) -> bool {
        probe_pid(pid)
    }
}

fn probe_pid(pid: u32) -> bool {
    let Ok(target) = UnixProcessControl::to_pid(pid) else {
        return false;
    };

    match signal::kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name may contain spaces and parens; state follows the last ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[async_trait]
impl ProcessControl for UnixProcessControl {
    fn spawn(&self, command: &str, args: &[String]) -> Result<Child> {
        ProcessBuilder::new(command)
            .args(args)
            .spawn_with(|cmd| {
                cmd.process_group(0);
            })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<Termination> {
        let pid = handle.pid();

        if self.leader_gone(handle) && !Self::group_exists(pid) {
            return Ok(Termination::AlreadyGone);
        }

        debug!("Sending SIGTERM to process group {}", pid);
        match Self::signal_group(pid, Signal::Terminate) {
            Ok(Termination::AlreadyGone) => return Ok(Termination::AlreadyGone),
            Ok(_) => {}
            Err(e) => warn!("Graceful termination of {} failed: {}", pid, e),
        }

        let _ = tokio::time::timeout(self.grace, handle.exited()).await;

        if self.leader_gone(handle) && !Self::group_exists(pid) {
            debug!("Process group {} exited within the grace window", pid);
            return Ok(Termination::Terminated);
        }

        debug!("Grace window elapsed, sending SIGKILL to process group {}", pid);
        if Self::signal_group(pid, Signal::Kill)? == Termination::AlreadyGone {
            return Ok(Termination::Terminated);
        }

        if tokio::time::timeout(self.kill_timeout, handle.exited())
            .await
            .is_err()
            && probe_pid(pid)
        {
            warn!("Process {} survived SIGKILL", pid);
            return Ok(Termination::StillAlive);
        }

        Ok(Termination::Terminated)
    }

    fn is_alive(&self, pid: u32) -> bool {
        probe_pid(pid)
    }
}
