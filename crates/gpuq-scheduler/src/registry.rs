//! Server registry: one live scheduler instance per database

use chrono::Utc;
use gpuq_core::{GpuqError, GpuqResult, ServerRecord};
use gpuq_runtime::{Launcher, Signal};
use gpuq_store::{Registration, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Result of [`ServerRegistry::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No server was running
    Idle,
    Stopped { pid: u32 },
}

/// Start and stop bookkeeping for scheduler processes
pub struct ServerRegistry {
    store: SqliteStore,
    launcher: Arc<dyn Launcher>,
    retry_interval: Duration,
}

impl ServerRegistry {
    pub fn new(store: SqliteStore, launcher: Arc<dyn Launcher>, retry_interval: Duration) -> Self {
        Self {
            store,
            launcher,
            retry_interval,
        }
    }

    /// Register `pid` as the running server.
    ///
    /// Fails with [`GpuqError::AlreadyRunning`] while a previous instance is
    /// alive. A previous instance that died without stopping is marked stopped.
    pub async fn start(&self, pid: u32) -> GpuqResult<ServerRecord> {
        let launcher = &self.launcher;
        match self
            .store
            .register_server(pid, |holder| launcher.is_alive(holder))
            .await?
        {
            Registration::Started { record, recovered } => {
                if let Some(previous) = recovered {
                    warn!(
                        pid = previous.pid,
                        started = %previous.start_time,
                        "Recovered from a server that did not stop cleanly"
                    );
                }
                info!(pid = record.pid, server_id = record.id, "Server registered");
                Ok(record)
            }
            Registration::Conflict(existing) => Err(GpuqError::AlreadyRunning {
                pid: existing.pid,
                since: existing.start_time,
            }),
        }
    }

    /// Signal the latest server until its process is gone.
    ///
    /// Retries at a fixed interval with no timeout. The server performs its
    /// own shutdown sequence on receipt of the signal.
    pub async fn stop(&self) -> GpuqResult<StopOutcome> {
        let Some(record) = self.store.last_server().await? else {
            return Ok(StopOutcome::Idle);
        };
        if record.is_stopped() {
            return Ok(StopOutcome::Idle);
        }

        let pid = record.pid;
        while self.launcher.is_alive(pid) {
            info!(pid = pid, "Sending terminate signal to server");
            if let Err(e) = self.launcher.signal(pid, Signal::Terminate) {
                if !self.launcher.is_alive(pid) {
                    break;
                }
                warn!(pid = pid, error = %e, "Failed to signal server");
            }
            if self.wait_for_exit(pid).await {
                break;
            }
        }

        if self.store.mark_server_stopped(record.id, Utc::now()).await? {
            warn!(pid = pid, "Server exited without recording its stop");
        }
        info!(pid = pid, "Server stopped");
        Ok(StopOutcome::Stopped { pid })
    }

    /// Poll liveness for up to one retry interval
    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.retry_interval;
        loop {
            if !self.launcher.is_alive(pid) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(pid = pid, "Server still alive, signalling again");
                return false;
            }
            tokio::time::sleep(LIVENESS_POLL.min(deadline - now)).await;
        }
    }
}
