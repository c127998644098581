// Snapshot hand-off
//
// The capture path is synchronous; handing a finished snapshot to a sink is
// the first point where queueing is allowed. Sinks never block the caller.

use crate::model::EventSnapshot;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, warn};

pub trait SnapshotSink: Send + Sync {
    /// Fire-and-forget delivery
    fn send(&self, snapshot: EventSnapshot);
}

/// Bridges the synchronous capture path to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EventSnapshot>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SnapshotSink for ChannelSink {
    fn send(&self, snapshot: EventSnapshot) {
        match self.tx.try_send(snapshot) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(snapshot)) => {
                error!(
                    "Snapshot channel full! Dropping snapshot {} for tracepoint {}",
                    snapshot.id, snapshot.tracepoint.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Snapshot receiver dropped, future snapshots will be discarded");
            }
        }
    }
}

/// Keeps every snapshot in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    snapshots: Mutex<Vec<EventSnapshot>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<EventSnapshot> {
        std::mem::take(&mut *self.snapshots.lock())
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl SnapshotSink for CollectingSink {
    fn send(&self, snapshot: EventSnapshot) {
        self.snapshots.lock().push(snapshot);
    }
}
