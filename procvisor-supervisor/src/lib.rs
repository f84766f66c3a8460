#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::UnixProcessControl as PlatformControl;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::WindowsProcessControl as PlatformControl;

mod engine;
mod monitor;
mod registry;
mod sampler;
mod shutdown;
mod signals;
mod watcher;

pub use engine::Supervisor;
pub use monitor::{MonitoredSupervisor, ProcessMonitor};
pub use registry::ProcessRegistry;
pub use sampler::default_sampler;
#[cfg(target_os = "linux")]
pub use sampler::ProcSampler;
pub use shutdown::ShutdownCoordinator;
pub use signals::wait_for_shutdown_signal;

use procvisor_core::{ProcessControl, SupervisorConfig};
use std::sync::Arc;
use tracing::debug;

pub fn create_process_control(config: &SupervisorConfig) -> Arc<dyn ProcessControl> {
    debug!("Creating platform-specific process control");
    Arc::new(PlatformControl::new(config))
}

/// Zero-effect liveness probe for an arbitrary pid.
pub fn is_process_alive(pid: u32) -> bool {
    PlatformControl::probe(pid)
}
