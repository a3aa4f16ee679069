//! Supervised background workflows.
//!
//! Streamed operations run here rather than on the connection task that started them,
//! so a caller hanging up never abandons a workflow halfway. Shutdown stops accepting
//! new work and waits for what is in flight.

use stardeck_core::{Result, StardeckError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct Supervisor {
    tasks: Arc<Mutex<JoinSet<()>>>,
    closed: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background until it finishes.
    pub fn spawn<F>(&self, name: String, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StardeckError::Internal("daemon is shutting down".to_string()));
        }
        let mut tasks = self.lock();
        // Reap finished tasks so the set only holds live work.
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "supervised workflow panicked");
            }
        }
        tasks.spawn(async move {
            task.await;
            tracing::debug!(workflow = %name, "supervised workflow finished");
        });
        Ok(())
    }

    /// Number of workflows still running.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Refuse new work, then wait up to `grace` for in-flight workflows.
    ///
    /// Returns the number of workflows that were still running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *self.lock());
        if tasks.is_empty() {
            return 0;
        }

        info!(count = tasks.len(), "waiting for in-flight workflows");
        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    warn!(error = %e, "supervised workflow panicked");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => 0,
            Err(_) => {
                let remaining = tasks.len();
                warn!(remaining, "grace period elapsed with workflows still running");
                tasks.abort_all();
                remaining
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        // A poisoned set still holds valid handles.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
