use parking_lot::{RwLock, RwLockReadGuard};
use procvisor_core::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the one-way "stopping" transition and every watcher task.
///
/// The gate's read side is held while a child is spawned and registered;
/// flipping the flag takes the write side, so once [`begin`](Self::begin)
/// returns every admitted process is already visible in the registry.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    gate: RwLock<bool>,
    stopping: CancellationToken,
    completed: CancellationToken,
    watchers: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Cancelled the moment shutdown begins.
    pub fn stopping_token(&self) -> CancellationToken {
        self.stopping.clone()
    }

    /// Admission ticket for spawning a new child.
    pub fn admit(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let gate = self.gate.read();
        if *gate {
            return Err(Error::ShuttingDown);
        }
        Ok(gate)
    }

    /// Flips to stopping. Returns false if some other caller got there first.
    pub fn begin(&self) -> bool {
        let mut gate = self.gate.write();
        if *gate {
            return false;
        }
        *gate = true;
        self.stopping.cancel();
        true
    }

    pub fn track<F>(&self, watcher: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.watchers.spawn(watcher);
    }

    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    /// Waits until every tracked watcher has returned.
    pub async fn drain(&self) {
        self.watchers.close();
        self.watchers.wait().await;
    }

    pub fn complete(&self) {
        self.completed.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    pub async fn completed(&self) {
        self.completed.cancelled().await;
    }
}
