use async_trait::async_trait;
use procvisor_core::{
    Error, ProcessBuilder, ProcessControl, ProcessHandle, Result, SupervisorConfig, Termination,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, GetLastError, STILL_ACTIVE,
};
use windows_sys::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_TERMINATE, TerminateProcess,
};

/// Tree termination through `taskkill /T`, falling back to `TerminateProcess`
/// on the leader when the tool is unavailable or fails.
pub struct WindowsProcessControl {
    kill_timeout: Duration,
}

impl WindowsProcessControl {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            kill_timeout: config.kill_timeout(),
        }
    }

    async fn taskkill(pid: u32) -> bool {
        let result = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => true,
            Ok(status) => {
                debug!("taskkill for {} exited with {}", pid, status);
                false
            }
            Err(e) => {
                debug!("taskkill unavailable: {}", e);
                false
            }
        }
    }

    /// Direct handle terminate. An invalid-parameter error from
    /// `OpenProcess` means the process no longer exists.
    fn terminate_process(pid: u32) -> Result<()> {
        // SAFETY: plain Win32 calls on a handle owned by this function.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE | PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                let err = GetLastError();
                if err == ERROR_INVALID_PARAMETER {
                    return Ok(());
                }
                return Err(Error::Windows(err));
            }

            let ok = TerminateProcess(handle, 1);
            let err = if ok == 0 { GetLastError() } else { 0 };
            CloseHandle(handle);

            if ok == 0 && err != ERROR_ACCESS_DENIED {
                return Err(Error::Windows(err));
            }
        }
        Ok(())
    }

    /// Zero-effect existence probe: query handle plus exit code check.
    pub fn probe(pid: u32) -> bool {
        probe_pid(pid)
    }
}

fn probe_pid(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    // SAFETY: the handle is closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            // A protected process we may not open still exists.
            return is_access_denied(GetLastError());
        }

        let mut exit_code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);

        ok != 0 && exit_code == STILL_ACTIVE as u32
    }
}

fn is_access_denied(err: u32) -> bool {
    err == ERROR_ACCESS_DENIED
}

#[async_trait]
impl ProcessControl for WindowsProcessControl {
    fn spawn(&self, command: &str, args: &[String]) -> Result<Child> {
        ProcessBuilder::new(command)
            .args(args)
            .spawn_with(|cmd| {
                cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
            })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<Termination> {
        let pid = handle.pid();

        if handle.has_exited() || !probe_pid(pid) {
            return Ok(Termination::AlreadyGone);
        }

        if !Self::taskkill(pid).await && probe_pid(pid) {
            debug!("Falling back to TerminateProcess for {}", pid);
            if let Err(e) = Self::terminate_process(pid) {
                if !probe_pid(pid) {
                    return Ok(Termination::Terminated);
                }
                warn!("TerminateProcess failed for {}: {}", pid, e);
                return Err(e);
            }
        }

        if tokio::time::timeout(self.kill_timeout, handle.exited())
            .await
            .is_err()
            && probe_pid(pid)
        {
            return Ok(Termination::StillAlive);
        }

        Ok(Termination::Terminated)
    }

    fn is_alive(&self, pid: u32) -> bool {
        probe_pid(pid)
    }
}
