pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use loader::ConfigLoader;

pub const CONFIG_FILE_NAME: &str = "procvisor.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn validate(&self) -> crate::Result<()> {
        self.supervisor.validate()?;
        self.monitor.validate()
    }
}

/// Timing knobs of the supervision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Pause between an unexpected exit and the automatic restart.
    pub restart_delay_ms: u64,
    /// Window between the graceful and the forceful termination signal.
    pub termination_grace_ms: u64,
    /// How long to wait for the exit after the forceful signal.
    pub kill_timeout_ms: u64,
    /// Pause between stopping and respawning on an explicit restart.
    pub restart_settle_ms: u64,
    /// How long a watcher lets its child live after shutdown begins.
    pub shutdown_grace_ms: u64,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 2000,
            termination_grace_ms: 100,
            kill_timeout_ms: 2000,
            restart_settle_ms: 100,
            shutdown_grace_ms: 5000,
            event_capacity: 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.event_capacity == 0 {
            return Err(crate::Error::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.kill_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "kill_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2000,
            history_size: 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_ms < 1000 {
            return Err(crate::Error::Config(
                "monitor interval must be at least 1 second".to_string(),
            ));
        }
        if self.history_size < 1 {
            return Err(crate::Error::Config(
                "history size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
