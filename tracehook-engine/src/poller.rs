// Tracepoint poller and snapshot drain
//
// The poller periodically asks the transport for a newer tracepoint set and
// applies it to the registry. The drain forwards snapshots from the
// capture-path channel to the transport.

use crate::error::{EngineError, EngineResult};
use crate::model::EventSnapshot;
use crate::registry::TracepointRegistry;
use crate::scheduler::PeriodicTask;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TracepointPoller {
    registry: Arc<TracepointRegistry>,
    transport: Arc<dyn Transport>,
}

impl TracepointPoller {
    pub fn new(registry: Arc<TracepointRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self { registry, transport }
    }

    /// Fetch once and apply; true when a new set was applied
    pub async fn poll_once(&self) -> EngineResult<bool> {
        let current = self.registry.current();
        let Some(update) = self.transport.fetch_update(current.hash()).await? else {
            debug!("Tracepoint set unchanged at generation {}", current.generation());
            return Ok(false);
        };

        // retransformation is synchronous and holds the writer lock
        let registry = self.registry.clone();
        let plan = tokio::task::spawn_blocking(move || registry.apply_update(update.hash, update.tracepoints))
            .await
            .map_err(|e| EngineError::Runtime(format!("tracepoint update task failed: {}", e)))??;
        if !plan.classes.is_empty() {
            info!("Tracepoint update retransformed {} classes", plan.classes.len());
        }
        Ok(true)
    }

    /// Poll every `period` until the returned task is stopped
    pub fn start(self: Arc<Self>, period: Duration) -> PeriodicTask {
        PeriodicTask::spawn("tracepoint-poller", period, move || {
            let poller = self.clone();
            async move {
                if let Err(e) = poller.poll_once().await {
                    warn!("Tracepoint poll failed: {}", e);
                }
            }
        })
    }
}

/// Forward snapshots to the transport until every sender is gone
///
/// Resolves to the number of snapshots the transport accepted.
pub fn spawn_snapshot_drain(
    mut rx: mpsc::Receiver<EventSnapshot>,
    transport: Arc<dyn Transport>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(snapshot) = rx.recv().await {
            let id = snapshot.id.clone();
            match transport.send(snapshot).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Dropping snapshot {}: {}", id, e),
            }
        }
        debug!("Snapshot drain finished after {} snapshots", delivered);
        delivered
    })
}
