use procvisor_core::Sampler;
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub use linux::ProcSampler;

pub fn default_sampler() -> Arc<dyn Sampler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcSampler::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(unsupported::UnsupportedSampler)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use procvisor_core::{Error, ProcessStats, Result, Sampler};
    use std::collections::HashMap;
    use std::fs;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Copy)]
    struct CpuTicks {
        at: Instant,
        ticks: u64,
    }

    /// Samples `/proc`. CPU usage is the tick delta since the previous
    /// sample of the same pid, so the first sample always reports 0%.
    #[derive(Debug)]
    pub struct ProcSampler {
        previous: Mutex<HashMap<u32, CpuTicks>>,
        clock_ticks: f64,
        page_size: u64,
    }

    impl Default for ProcSampler {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcSampler {
        pub fn new() -> Self {
            // SAFETY: sysconf has no preconditions.
            let (clock_ticks, page_size) = unsafe {
                (
                    libc::sysconf(libc::_SC_CLK_TCK),
                    libc::sysconf(libc::_SC_PAGESIZE),
                )
            };

            Self {
                previous: Mutex::new(HashMap::new()),
                clock_ticks: if clock_ticks > 0 { clock_ticks as f64 } else { 100.0 },
                page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            }
        }

        fn read_stat(pid: u32) -> Result<StatFields> {
            let content = fs::read_to_string(format!("/proc/{}/stat", pid))
                .map_err(|e| Error::Sampling(format!("process {}: {}", pid, e)))?;
            parse_stat(pid, &content)
        }

        fn read_rss_bytes(&self, pid: u32) -> Result<u64> {
            let content = fs::read_to_string(format!("/proc/{}/statm", pid))
                .map_err(|e| Error::Sampling(format!("process {}: {}", pid, e)))?;

            let pages = content
                .split_whitespace()
                .nth(1)
                .and_then(|field| field.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::Sampling(format!("invalid statm format for process {}", pid))
                })?;

            Ok(pages * self.page_size)
        }

        fn total_memory() -> Option<u64> {
            let content = fs::read_to_string("/proc/meminfo").ok()?;
            content
                .lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| kb * 1024)
        }

        /// Boot time plus the start offset in clock ticks.
        fn create_time(&self, start_ticks: u64) -> DateTime<Utc> {
            let offset = Duration::from_secs_f64(start_ticks as f64 / self.clock_ticks);
            boot_time()
                .and_then(|boot| chrono::Duration::from_std(offset).ok().map(|d| boot + d))
                .unwrap_or_else(Utc::now)
        }

        fn cpu_percent(&self, pid: u32, ticks: u64) -> f64 {
            let now = Instant::now();
            let mut previous = self.previous.lock();

            let percent = match previous.get(&pid) {
                Some(last) if ticks >= last.ticks => {
                    let elapsed = now.duration_since(last.at).as_secs_f64();
                    if elapsed > 0.0 {
                        ((ticks - last.ticks) as f64 / self.clock_ticks) / elapsed * 100.0
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };

            previous.insert(pid, CpuTicks { at: now, ticks });
            percent
        }
    }

    impl Sampler for ProcSampler {
        fn sample(&self, pid: u32) -> Result<ProcessStats> {
            if !crate::is_process_alive(pid) {
                self.previous.lock().remove(&pid);
                return Err(Error::Sampling(format!("process {} does not exist", pid)));
            }

            let stat = Self::read_stat(pid)?;
            let memory_bytes = self.read_rss_bytes(pid)?;
            let memory_percent = Self::total_memory()
                .filter(|total| *total > 0)
                .map(|total| memory_bytes as f64 / total as f64 * 100.0)
                .unwrap_or(0.0);

            Ok(ProcessStats {
                pid,
                cpu_percent: self.cpu_percent(pid, stat.cpu_ticks),
                create_time: self.create_time(stat.start_ticks),
                name: stat.name,
                memory_percent,
                memory_bytes,
                timestamp: Utc::now(),
            })
        }

        fn find_by_name(&self, name: &str) -> Result<Vec<(u32, String)>> {
            let entries = fs::read_dir("/proc")
                .map_err(|e| Error::Sampling(format!("failed to list /proc: {}", e)))?;

            let mut found: Vec<(u32, String)> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
                // Processes can exit mid-scan.
                .filter_map(|pid| Self::read_stat(pid).ok().map(|stat| (pid, stat.name)))
                .filter(|(_, comm)| comm == name)
                .collect();
            found.sort_by_key(|(pid, _)| *pid);
            Ok(found)
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    struct StatFields {
        name: String,
        cpu_ticks: u64,
        start_ticks: u64,
    }

    /// Parses `/proc/<pid>/stat`. The command name may contain spaces and
    /// parens, so fields are counted from the last ')'.
    fn parse_stat(pid: u32, content: &str) -> Result<StatFields> {
        let invalid = || Error::Sampling(format!("invalid stat format for process {}", pid));

        let open = content.find('(').ok_or_else(invalid)?;
        let close = content.rfind(')').ok_or_else(invalid)?;
        if close < open {
            return Err(invalid());
        }

        let name = content[open + 1..close].to_string();
        // fields[0] is the state, field 3 of the full line.
        let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
        let field = |n: usize| -> Result<u64> {
            fields
                .get(n - 3)
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(invalid)
        };

        Ok(StatFields {
            name,
            cpu_ticks: field(14)? + field(15)?,
            start_ticks: field(22)?,
        })
    }

    fn boot_time() -> Option<DateTime<Utc>> {
        let content = fs::read_to_string("/proc/stat").ok()?;
        let secs = content
            .lines()
            .find_map(|line| line.strip_prefix("btime"))?
            .trim()
            .parse::<i64>()
            .ok()?;
        DateTime::from_timestamp(secs, 0)
    }

}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use procvisor_core::{Error, ProcessStats, Result, Sampler};

    pub struct UnsupportedSampler;

    impl Sampler for UnsupportedSampler {
        fn sample(&self, pid: u32) -> Result<ProcessStats> {
            Err(Error::Sampling(format!(
                "resource sampling of process {} is not supported on this platform",
                pid
            )))
        }
    }
}
