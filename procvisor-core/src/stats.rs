use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One resource-usage sample of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    /// When the OS started the process.
    pub create_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Produces resource samples on demand. Implementations must not block for
/// longer than a few filesystem reads.
pub trait Sampler: Send + Sync {
    fn sample(&self, pid: u32) -> crate::Result<ProcessStats>;

    /// Every live `(pid, name)` whose OS-reported name equals `name`.
    fn find_by_name(&self, name: &str) -> crate::Result<Vec<(u32, String)>> {
        Err(crate::Error::Sampling(format!(
            "looking up processes by name ({}) is not supported",
            name
        )))
    }
}
