use procvisor_core::{
    Error, ExitStatus, ProcessControl, ProcessHandle, ProcessId, ProcessInfo, ProcessRecord,
    ProcessSpec, Result, SupervisorConfig, SupervisorEvent, Termination,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::registry::ProcessRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::watcher::Watcher;

/// The supervision engine.
///
/// Cloning is cheap; every clone drives the same registry and shutdown state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: ProcessRegistry,
    control: Arc<dyn ProcessControl>,
    config: SupervisorConfig,
    shutdown: ShutdownCoordinator,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Engine backed by the platform termination strategy.
    pub fn new(config: SupervisorConfig) -> Self {
        let control = crate::create_process_control(&config);
        Self::with_control(config, control)
    }

    pub fn with_control(config: SupervisorConfig, control: Arc<dyn ProcessControl>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        debug!("Supervisor created with {:?}", config);

        Self {
            inner: Arc::new(Inner {
                registry: ProcessRegistry::new(),
                control,
                config,
                shutdown: ShutdownCoordinator::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn control(&self) -> &Arc<dyn ProcessControl> {
        &self.inner.control
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_stopping()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_completed()
    }

    /// Resolves once a shutdown has fully completed.
    pub async fn stopped(&self) {
        self.inner.shutdown.completed().await;
    }

    pub fn active_watchers(&self) -> usize {
        self.inner.shutdown.active_watchers()
    }

    /// Spawns `command` in its own process group and starts watching it.
    pub async fn start(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
        auto_restart: bool,
    ) -> Result<ProcessId> {
        self.launch(ProcessSpec::new(command, args, auto_restart), 0)
    }

    /// Disables auto-restart, terminates the process tree and forgets the record.
    pub async fn stop(&self, id: &ProcessId) -> Result<()> {
        let record = self.lookup(id)?;

        record.disable_auto_restart();
        self.terminate_record(&record).await?;
        self.forget(id);

        info!("Stopped process: {} (id: {})", record.command(), id);
        Ok(())
    }

    /// Replaces the process with a fresh instance under a new id.
    pub async fn restart(&self, id: &ProcessId) -> Result<ProcessId> {
        let record = self.lookup(id)?;
        let spec = record.spec();

        // The old watcher must not race us into a second restart.
        record.disable_auto_restart();

        if record.is_running() {
            if let Err(e) = self.terminate_record(&record).await {
                if spec.auto_restart {
                    record.enable_auto_restart();
                }
                return Err(e);
            }
            tokio::time::sleep(self.inner.config.restart_settle()).await;
        }

        self.respawn(&record, spec, record.restart_count() + 1)
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.inner.registry.snapshot()
    }

    pub fn get_process(&self, id: &ProcessId) -> Option<ProcessInfo> {
        self.inner.registry.get(id).map(|record| record.snapshot())
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<ProcessInfo> {
        self.inner
            .registry
            .find_by_pid(pid)
            .map(|record| record.snapshot())
    }

    /// Waits for the watcher to observe the exit, bounded by `timeout`.
    ///
    /// This never waits on the OS handle itself; the watcher owns that.
    pub async fn wait_for_process(
        &self,
        id: &ProcessId,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>> {
        let handle = self.lookup(id)?.handle().clone();

        tokio::time::timeout(timeout, handle.exited())
            .await
            .map_err(|_| Error::Timeout(format!("process {}", id)))
    }

    /// Stops every registered process in parallel, ignoring failures.
    pub async fn stop_all(&self) {
        let records = self.inner.registry.records();
        if records.is_empty() {
            debug!("No processes to stop");
            return;
        }

        let mut stops = JoinSet::new();
        for record in records {
            record.disable_auto_restart();
            let supervisor = self.clone();
            stops.spawn(async move {
                if let Err(e) = supervisor.terminate_record(&record).await {
                    warn!("Failed to stop process {}: {}", record.id(), e);
                }
                supervisor.forget(record.id());
                info!(
                    "Stopped process: {} (id: {})",
                    record.command(),
                    record.id()
                );
            });
        }

        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                error!("Stop task failed: {}", e);
            }
        }

        info!("All processes stopped");
    }

    /// Stops everything and waits for every watcher to finish.
    ///
    /// Safe to call from several places at once: the first caller runs the
    /// sequence, the rest wait for it to complete.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.begin() {
            debug!("Shutdown already in progress");
            self.inner.shutdown.completed().await;
            return;
        }

        info!("Shutting down supervisor...");
        self.emit(SupervisorEvent::ShutdownStarted);

        self.stop_all().await;
        self.inner.shutdown.drain().await;

        // Anything a watcher left behind after the stop fan-out.
        for record in self.inner.registry.records() {
            self.forget(record.id());
        }

        self.emit(SupervisorEvent::ShutdownCompleted);
        self.inner.shutdown.complete();
        info!("Supervisor shutdown complete");
    }

    fn lookup(&self, id: &ProcessId) -> Result<Arc<ProcessRecord>> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Spawn, register, watch. Synchronous so the admission guard is never
    /// held across an await.
    pub(crate) fn launch(&self, spec: ProcessSpec, restart_count: u32) -> Result<ProcessId> {
        let inner = &self.inner;
        let _admission = inner.shutdown.admit()?;

        let mut child = inner.control.spawn(&spec.command, &spec.args)?;
        let Some(pid) = child.id() else {
            return Err(Error::SpawnFailed(format!(
                "{}: child exited before it could be registered",
                spec.command
            )));
        };

        let id = ProcessId::generate();
        let command = spec.command.clone();
        let (handle, notifier) = ProcessHandle::new(pid);
        let record = Arc::new(ProcessRecord::new(id.clone(), spec, handle, restart_count));

        if let Err(e) = inner.registry.insert(record.clone()) {
            error!("Registry invariant violated: {}", e);
            let _ = child.start_kill();
            return Err(e);
        }

        inner
            .shutdown
            .track(Watcher::new(self.clone(), record, child, notifier).run());

        info!("Started process: {} (id: {}, pid: {})", command, id, pid);
        self.emit(SupervisorEvent::ProcessStarted {
            id: id.clone(),
            pid,
            command,
        });

        Ok(id)
    }

    /// Supersedes `old` with a new record carrying `restart_count`.
    ///
    /// The replacement is registered before `old` is forgotten. `old` is
    /// forgotten even when the launch fails.
    pub(crate) fn respawn(
        &self,
        old: &ProcessRecord,
        spec: ProcessSpec,
        restart_count: u32,
    ) -> Result<ProcessId> {
        let launched = self.launch(spec, restart_count);
        self.forget(old.id());
        let new_id = launched?;
        info!(
            "Restarted process: {} (old id: {}, new id: {})",
            old.command(),
            old.id(),
            new_id
        );
        self.emit(SupervisorEvent::ProcessRestarted {
            old: old.id().clone(),
            new: new_id.clone(),
        });

        Ok(new_id)
    }

    /// Runs the termination strategy at most once at a time per record.
    async fn terminate_record(&self, record: &ProcessRecord) -> Result<()> {
        let _guard = record.lock_termination().await;
        let control = &self.inner.control;

        match control.terminate(record.handle()).await {
            Ok(Termination::StillAlive) => Err(Error::StopFailed {
                id: record.id().clone(),
                reason: format!("process {} is still alive", record.pid()),
            }),
            Ok(outcome) => {
                debug!("Termination of {} finished: {:?}", record.id(), outcome);
                Ok(())
            }
            Err(e) if !control.is_alive(record.pid()) => {
                debug!(
                    "Termination of {} reported {}, but the process is gone",
                    record.id(),
                    e
                );
                Ok(())
            }
            Err(e) => Err(Error::StopFailed {
                id: record.id().clone(),
                reason: e.to_string(),
            }),
        }
    }

    pub(crate) fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub(crate) fn shutdown_state(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    /// Removes a record, announcing it only if it was still registered.
    pub(crate) fn forget(&self, id: &ProcessId) -> Option<Arc<ProcessRecord>> {
        let record = self.inner.registry.remove(id)?;
        self.emit(SupervisorEvent::ProcessRemoved {
            id: id.clone(),
            pid: record.pid(),
        });
        Some(record)
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("processes", &self.inner.registry.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
