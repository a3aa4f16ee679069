//! Graceful shutdown handling for stardeckd.
//!
//! Managed containers keep running across daemon restarts; shutdown only lets in-flight
//! workflows finish and closes the metadata store.

use crate::supervisor::Supervisor;
use stardeck_core::StateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Coordinates the final phase of the daemon's life.
pub struct ShutdownManager {
    state: Arc<StateManager>,
    supervisor: Supervisor,
    /// How long in-flight workflows get to finish
    grace: Duration,
}

impl ShutdownManager {
    pub fn new(state: Arc<StateManager>, supervisor: Supervisor, grace: Duration) -> Self {
        Self { state, supervisor, grace }
    }

    /// Drain supervised workflows, then close the database.
    pub async fn shutdown(&self) {
        info!("Starting graceful shutdown...");

        let in_flight = self.supervisor.in_flight();
        if in_flight > 0 {
            info!(in_flight, grace_secs = self.grace.as_secs(), "Waiting for workflows to finish");
        }

        let abandoned = self.supervisor.shutdown(self.grace).await;
        if abandoned > 0 {
            error!(
                abandoned,
                "Workflows were still running at shutdown; check for leftover *_backup_* containers"
            );
        }

        self.state.pool().close().await;
        info!("Graceful shutdown complete");
    }
}

/// Create a shutdown signal receiver.
///
/// Returns a broadcast receiver that will receive a signal when SIGTERM or SIGINT is received.
pub fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = tx.send(());
    });

    rx
}
