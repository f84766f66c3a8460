use procvisor_core::{ExitNotifier, ExitStatus, ProcessRecord, SupervisorEvent};
use std::sync::Arc;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use crate::engine::Supervisor;

/// One per running child: waits for the exit, then either restarts the
/// process under a new id or removes its record.
pub(crate) struct Watcher {
    supervisor: Supervisor,
    record: Arc<ProcessRecord>,
    child: Child,
    notifier: ExitNotifier,
}

impl Watcher {
    pub(crate) fn new(
        supervisor: Supervisor,
        record: Arc<ProcessRecord>,
        child: Child,
        notifier: ExitNotifier,
    ) -> Self {
        Self {
            supervisor,
            record,
            child,
            notifier,
        }
    }

    pub(crate) async fn run(self) {
        let Self {
            supervisor,
            record,
            mut child,
            notifier,
        } = self;

        let status = wait_child(&supervisor, &record, &mut child).await;
        drop(child);

        record.mark_exited(status);
        notifier.notify(status);

        match status {
            Some(status) if status.success() => info!(
                "Process {} (id: {}) exited with {}",
                record.command(),
                record.id(),
                status
            ),
            Some(status) => warn!(
                "Process {} (id: {}) exited with {}",
                record.command(),
                record.id(),
                status
            ),
            None => {}
        }

        supervisor.emit(SupervisorEvent::ProcessExited {
            id: record.id().clone(),
            pid: record.pid(),
            status,
        });

        after_exit(&supervisor, &record).await;
    }
}

/// The watcher's only suspension point on a live child. Once shutdown is
/// underway the child gets `shutdown_grace` to be reaped by the stop fan-out
/// before the watcher kills the leader itself.
async fn wait_child(
    supervisor: &Supervisor,
    record: &ProcessRecord,
    child: &mut Child,
) -> Option<ExitStatus> {
    let stopping = supervisor.shutdown_state().stopping_token();

    let early = tokio::select! {
        biased;
        result = child.wait() => Some(result),
        _ = stopping.cancelled() => None,
    };

    let result = match early {
        Some(result) => result,
        None => {
            let grace = supervisor.config().shutdown_grace();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Process {} (id: {}) outlived the shutdown grace period, killing it",
                        record.pid(),
                        record.id()
                    );
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process {}: {}", record.pid(), e);
                    }
                    child.wait().await
                }
            }
        }
    };

    match result {
        Ok(status) => Some(ExitStatus::from_std(status)),
        Err(e) => {
            error!(
                "Failed to wait for process {} (id: {}): {}",
                record.command(),
                record.id(),
                e
            );
            None
        }
    }
}

/// Exited -> Removed | Restarting.
async fn after_exit(supervisor: &Supervisor, record: &ProcessRecord) {
    let id = record.id();

    if supervisor.is_stopping() {
        debug!("Supervisor stopping, not restarting {}", id);
        supervisor.forget(id);
        return;
    }

    if !record.auto_restart() {
        supervisor.forget(id);
        return;
    }

    let restart_count = record.increment_restart_count();
    let delay = supervisor.config().restart_delay();
    info!(
        "Auto-restarting process: {} (id: {}, restart count: {})",
        record.command(),
        id,
        restart_count
    );
    supervisor.emit(SupervisorEvent::ProcessRestarting {
        id: id.clone(),
        restart_count,
        delay,
    });

    let stopping = supervisor.shutdown_state().stopping_token();
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = stopping.cancelled() => {
            debug!("Shutdown during restart delay of {}", id);
            supervisor.forget(id);
            return;
        }
    }

    // A stop may have landed during the delay.
    let still_wanted = supervisor
        .registry()
        .get(id)
        .is_some_and(|current| current.auto_restart());
    if !still_wanted {
        debug!("Restart of {} cancelled", id);
        supervisor.forget(id);
        return;
    }

    if let Err(e) = supervisor.respawn(record, record.spec(), restart_count) {
        error!(
            "Failed to restart process {} (id: {}): {}",
            record.command(),
            id,
            e
        );
    }
}
