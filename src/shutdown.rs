//! Graceful Shutdown Handling
//!
//! Signal plumbing for the relay binary: listens for SIGTERM and SIGINT and
//! broadcasts a shutdown notice to background tasks.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::Result;

/// Coordinates shutdown between the signal handler and background tasks
pub struct ShutdownCoordinator {
    /// Broadcast sender for the shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Block until a termination signal arrives, then notify subscribers.
    ///
    /// Handles SIGTERM and SIGINT on Unix, Ctrl+C elsewhere.
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        Ok(())
    }

    /// Notify subscribers without waiting for a signal
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
