pub mod config;
pub mod error;
pub mod process;
pub mod record;
pub mod stats;
pub mod supervisor;

pub use config::{Config, ConfigLoader, MonitorConfig, SupervisorConfig};
pub use error::{Error, Result};
pub use process::{ExitNotifier, ExitStatus, ProcessBuilder, ProcessHandle, ProcessId, Signal};
pub use record::{ProcessInfo, ProcessRecord, ProcessSpec};
pub use stats::{ProcessStats, Sampler};
pub use supervisor::{ProcessControl, SupervisorEvent, Termination};
