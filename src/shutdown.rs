//! Graceful Shutdown Handling
//!
//! Listens for SIGTERM/SIGINT (Ctrl+C on Windows), then stops the relay
//! server and waits for its sessions to close.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::RelayServer;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    requested: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown without waiting for an OS signal
    pub fn trigger(&self) {
        self.requested.cancel();
    }

    /// Wait for SIGTERM, SIGINT or an explicit `trigger`
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
                _ = self.requested.cancelled() => {
                    info!("Shutdown requested");
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.requested.cancelled() => {
                    info!("Shutdown requested");
                }
            }
        }

        self.trigger();
        Ok(())
    }

    /// Stop the server and wait for its sessions to close
    pub async fn shutdown_server(&self, server: &RelayServer) -> Result<()> {
        server.shutdown().await
    }
}
