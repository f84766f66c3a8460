//! OS signal adapter.
//!
//! On Unix SIGINT, SIGTERM and SIGQUIT trigger shutdown, with
//! [`tokio::signal::ctrl_c`] awaited as well. Elsewhere only Ctrl-C is
//! observed.

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::Supervisor;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(())
}

impl Supervisor {
    /// Turns the first shutdown signal into [`Supervisor::shutdown`].
    ///
    /// The task ends on its own when shutdown completes through another path.
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = wait_for_shutdown_signal() => {
                    if let Err(e) = result {
                        error!("Failed to listen for shutdown signals: {}", e);
                        return;
                    }
                    supervisor.shutdown().await;
                }
                _ = supervisor.stopped() => {}
            }
        })
    }
}
