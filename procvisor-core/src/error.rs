use thiserror::Error;

use crate::ProcessId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Process {0} not found")]
    NotFound(ProcessId),

    #[error("Failed to stop process {id}: {reason}")]
    StopFailed { id: ProcessId, reason: String },

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    AlreadyStopped(String),

    #[error("Process id {0} is already registered")]
    DuplicateId(ProcessId),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Process {0} is already being monitored")]
    AlreadyMonitored(u32),

    #[error("Process {0} is not being monitored")]
    NotMonitored(u32),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[cfg(unix)]
    #[error("Unix error: {0}")]
    Unix(#[from] nix::errno::Errno),

    #[cfg(windows)]
    #[error("Windows error: {0}")]
    Windows(u32),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the errors a caller is expected to handle as a normal outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
