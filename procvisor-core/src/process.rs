use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Opaque identity of one supervised process instance.
///
/// A restart always produces a new id; only `restart_count` links the
/// instances of the same logical process together.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProcessId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Exited(Option<ExitStatus>),
}

/// Observer side of a supervised child.
///
/// The watcher task owns the `Child` and is the only caller that waits on
/// it; everything else learns about the exit through this handle.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Lifecycle>,
}

/// Sending half held by the watcher task.
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<Lifecycle>,
}

impl ExitNotifier {
    /// Publishes the exit. `None` means the OS wait itself failed.
    pub fn notify(self, status: Option<ExitStatus>) {
        let _ = self.tx.send(Lifecycle::Exited(status));
    }
}

impl ProcessHandle {
    pub fn new(pid: u32) -> (Self, ExitNotifier) {
        let (tx, exit) = watch::channel(Lifecycle::Running);
        (Self { pid, exit }, ExitNotifier { tx })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        matches!(*self.exit.borrow(), Lifecycle::Exited(_)) || self.exit.has_changed().is_err()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.exit.borrow() {
            Lifecycle::Exited(status) => status,
            Lifecycle::Running => None,
        }
    }

    /// Resolves once the watcher has observed the exit.
    ///
    /// A notifier dropped without publishing counts as an exit with no status.
    pub async fn exited(&self) -> Option<ExitStatus> {
        let mut rx = self.exit.clone();
        match rx
            .wait_for(|state| matches!(state, Lifecycle::Exited(_)))
            .await
        {
            Ok(state) => match *state {
                Lifecycle::Exited(status) => status,
                Lifecycle::Running => None,
            },
            Err(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as NixSignal;
        match self {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }

    pub fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self { code, signal }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Launch spec for a supervised child: stdout and stderr are inherited,
/// stdin is closed.
pub struct ProcessBuilder {
    command: String,
    args: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Spawns the child. `configure` gets the final say over the command so
    /// platform code can place it in its own process group.
    pub fn spawn_with<F>(self, configure: F) -> crate::Result<Child>
    where
        F: FnOnce(&mut Command),
    {
        tracing::debug!(
            "Spawning process: command='{}', args={:?}",
            self.command,
            self.args
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        configure(&mut cmd);

        cmd.spawn()
            .map_err(|e| crate::Error::SpawnFailed(format!("{}: {}", self.command, e)))
    }
}
