use parking_lot::{Mutex, RwLock};
use procvisor_core::{
    Config, Error, ExitStatus, MonitorConfig, ProcessId, ProcessInfo, ProcessStats, Result,
    Sampler, SupervisorEvent,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::Supervisor;

#[derive(Debug, Default)]
struct MonitorState {
    monitored: HashMap<u32, String>,
    history: HashMap<u32, VecDeque<ProcessStats>>,
}

/// Periodic resource sampling of a set of pids with bounded history.
pub struct ProcessMonitor {
    sampler: Arc<dyn Sampler>,
    state: Arc<RwLock<MonitorState>>,
    config: Arc<RwLock<MonitorConfig>>,
    collector: Mutex<Option<CancellationToken>>,
}

impl ProcessMonitor {
    pub fn new(config: MonitorConfig, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            sampler,
            state: Arc::new(RwLock::new(MonitorState::default())),
            config: Arc::new(RwLock::new(config)),
            collector: Mutex::new(None),
        }
    }

    /// Starts the collection loop.
    pub fn start(&self) -> Result<()> {
        let mut collector = self.collector.lock();
        if collector.is_some() {
            return Err(Error::AlreadyRunning("process monitor".to_string()));
        }

        let token = CancellationToken::new();
        let sampler = self.sampler.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                let interval = config.read().interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.cancelled() => break,
                }
                let history_size = config.read().history_size;
                collect(sampler.as_ref(), &state, history_size);
            }
            debug!("Process monitor loop stopped");
        });

        *collector = Some(token);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        match self.collector.lock().take() {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(Error::AlreadyStopped("process monitor".to_string())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.collector.lock().is_some()
    }

    pub fn add_process(&self, pid: u32, name: impl Into<String>) -> Result<()> {
        let mut state = self.state.write();
        if state.monitored.contains_key(&pid) {
            return Err(Error::AlreadyMonitored(pid));
        }

        let capacity = self.config.read().history_size;
        state.monitored.insert(pid, name.into());
        state.history.insert(pid, VecDeque::with_capacity(capacity));
        Ok(())
    }

    pub fn remove_process(&self, pid: u32) -> Result<()> {
        let mut state = self.state.write();
        if state.monitored.remove(&pid).is_none() {
            return Err(Error::NotMonitored(pid));
        }
        state.history.remove(&pid);
        Ok(())
    }

    pub fn is_monitored(&self, pid: u32) -> bool {
        self.state.read().monitored.contains_key(&pid)
    }

    pub fn monitored_processes(&self) -> HashMap<u32, String> {
        self.state.read().monitored.clone()
    }

    /// Samples `pid` right now, monitored or not.
    pub fn process_stats(&self, pid: u32) -> Result<ProcessStats> {
        let mut stats = self.sampler.sample(pid)?;
        if let Some(name) = self.state.read().monitored.get(&pid) {
            stats.name = name.clone();
        }
        Ok(stats)
    }

    /// Fresh samples of every monitored pid that could be sampled, by pid.
    pub fn all_stats(&self) -> Vec<ProcessStats> {
        let monitored = self.monitored_processes();
        let mut stats: Vec<ProcessStats> = monitored
            .into_iter()
            .filter_map(|(pid, name)| {
                self.sampler.sample(pid).ok().map(|mut stats| {
                    stats.name = name;
                    stats
                })
            })
            .collect();
        stats.sort_by_key(|stats| stats.pid);
        stats
    }

    /// Fresh samples of every live process the OS names `name`, monitored
    /// or not. Processes that exit before they are sampled are skipped.
    pub fn stats_by_name(&self, name: &str) -> Result<Vec<ProcessStats>> {
        let matches = self.sampler.find_by_name(name)?;
        Ok(matches
            .into_iter()
            .filter_map(|(pid, actual)| {
                self.sampler.sample(pid).ok().map(|mut stats| {
                    stats.name = actual;
                    stats
                })
            })
            .collect())
    }

    /// Starts monitoring every live process named `name`. Returns the pids
    /// newly added; already monitored ones are left as they are.
    pub fn monitor_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let mut added = Vec::new();
        for stats in self.stats_by_name(name)? {
            match self.add_process(stats.pid, stats.name) {
                Ok(()) => added.push(stats.pid),
                Err(Error::AlreadyMonitored(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// The newest `count` samples of `pid`, oldest first.
    pub fn history(&self, pid: u32, count: usize) -> Result<Vec<ProcessStats>> {
        let state = self.state.read();
        let history = state.history.get(&pid).ok_or(Error::NotMonitored(pid))?;
        let skip = history.len().saturating_sub(count);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: MonitorConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Runs one collection pass immediately.
    pub fn collect_now(&self) {
        let history_size = self.config.read().history_size;
        collect(self.sampler.as_ref(), &self.state, history_size);
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.collector.lock().take() {
            token.cancel();
        }
    }
}

/// Samples every monitored pid outside the lock. A pid that can no longer
/// be sampled has exited and is dropped from monitoring.
fn collect(sampler: &dyn Sampler, state: &RwLock<MonitorState>, history_size: usize) {
    let monitored = state.read().monitored.clone();

    for (pid, name) in monitored {
        match sampler.sample(pid) {
            Ok(mut stats) => {
                stats.name = name;
                let mut state = state.write();
                // Removed while we were sampling.
                let Some(history) = state.history.get_mut(&pid) else {
                    continue;
                };
                history.push_back(stats);
                while history.len() > history_size {
                    history.pop_front();
                }
            }
            Err(e) => {
                debug!("Dropping process {} from monitoring: {}", pid, e);
                let mut state = state.write();
                state.monitored.remove(&pid);
                state.history.remove(&pid);
            }
        }
    }
}

/// Supervisor decorator that mirrors registry membership into a
/// [`ProcessMonitor`], including processes replaced by auto-restarts.
pub struct MonitoredSupervisor {
    supervisor: Supervisor,
    monitor: Arc<ProcessMonitor>,
    mirror: JoinHandle<()>,
}

impl MonitoredSupervisor {
    pub fn new(supervisor: Supervisor, monitor: ProcessMonitor) -> Self {
        let monitor = Arc::new(monitor);
        let mirror = tokio::spawn(mirror_membership(
            supervisor.clone(),
            monitor.clone(),
            supervisor.subscribe(),
        ));

        if monitor.config().enabled
            && let Err(e) = monitor.start()
        {
            warn!("Failed to start process monitor: {}", e);
        }

        Self {
            supervisor,
            monitor,
            mirror,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Supervisor::new(config.supervisor.clone()),
            ProcessMonitor::new(config.monitor.clone(), crate::default_sampler()),
        )
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    pub async fn start(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
        auto_restart: bool,
    ) -> Result<ProcessId> {
        let id = self.supervisor.start(command, args, auto_restart).await?;
        if let Some(info) = self.supervisor.get_process(&id) {
            track(&self.monitor, info.pid, &info.command);
        }
        Ok(id)
    }

    pub async fn stop(&self, id: &ProcessId) -> Result<()> {
        let pid = self.untrack(id);
        let result = self.supervisor.stop(id).await;
        // The mirror may have re-added it from a queued start event.
        if result.is_ok()
            && let Some(pid) = pid
        {
            let _ = self.monitor.remove_process(pid);
        }
        result
    }

    pub async fn restart(&self, id: &ProcessId) -> Result<ProcessId> {
        let pid = self.untrack(id);
        let new_id = self.supervisor.restart(id).await?;
        if let Some(pid) = pid {
            let _ = self.monitor.remove_process(pid);
        }
        if let Some(info) = self.supervisor.get_process(&new_id) {
            track(&self.monitor, info.pid, &info.command);
        }
        Ok(new_id)
    }

    /// Stops the collection loop first, then every process.
    pub async fn stop_all(&self) {
        if let Err(e) = self.monitor.stop() {
            debug!("{}", e);
        }
        self.supervisor.stop_all().await;
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.monitor.stop() {
            debug!("{}", e);
        }
        self.supervisor.shutdown().await;
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.supervisor.list_processes()
    }

    pub fn get_process(&self, id: &ProcessId) -> Option<ProcessInfo> {
        self.supervisor.get_process(id)
    }

    pub async fn wait_for_process(
        &self,
        id: &ProcessId,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>> {
        self.supervisor.wait_for_process(id, timeout).await
    }

    pub fn stats_by_id(&self, id: &ProcessId) -> Result<ProcessStats> {
        let info = self
            .supervisor
            .get_process(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        self.monitor.process_stats(info.pid)
    }

    pub fn history_by_id(&self, id: &ProcessId, count: usize) -> Result<Vec<ProcessStats>> {
        let info = self
            .supervisor
            .get_process(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        self.monitor.history(info.pid, count)
    }

    pub fn all_stats(&self) -> Vec<ProcessStats> {
        self.monitor.all_stats()
    }

    pub fn stats_by_name(&self, name: &str) -> Result<Vec<ProcessStats>> {
        self.monitor.stats_by_name(name)
    }

    /// Also covers processes this supervisor did not start.
    pub fn monitor_by_name(&self, name: &str) -> Result<Vec<u32>> {
        self.monitor.monitor_by_name(name)
    }

    fn untrack(&self, id: &ProcessId) -> Option<u32> {
        let info = self.supervisor.get_process(id)?;
        let _ = self.monitor.remove_process(info.pid);
        Some(info.pid)
    }
}

impl Drop for MonitoredSupervisor {
    fn drop(&mut self) {
        self.mirror.abort();
    }
}

fn track(monitor: &ProcessMonitor, pid: u32, name: &str) {
    match monitor.add_process(pid, name) {
        Ok(()) | Err(Error::AlreadyMonitored(_)) => {}
        Err(e) => warn!("Failed to monitor process {}: {}", pid, e),
    }
}

async fn mirror_membership(
    supervisor: Supervisor,
    monitor: Arc<ProcessMonitor>,
    mut events: broadcast::Receiver<SupervisorEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::ProcessStarted { id, pid, command }) => {
                // Already stopped by the time the event got here.
                if supervisor.get_process(&id).is_some() {
                    track(&monitor, pid, &command);
                }
            }
            Ok(SupervisorEvent::ProcessRemoved { pid, .. }) => {
                let _ = monitor.remove_process(pid);
            }
            Ok(SupervisorEvent::ShutdownCompleted) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Monitor mirror lagged by {} events, resyncing", skipped);
                let live: HashMap<u32, String> = supervisor
                    .list_processes()
                    .into_iter()
                    .map(|info| (info.pid, info.command))
                    .collect();
                for pid in monitor.monitored_processes().into_keys() {
                    if !live.contains_key(&pid) {
                        let _ = monitor.remove_process(pid);
                    }
                }
                for (pid, command) in live {
                    track(&monitor, pid, &command);
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
