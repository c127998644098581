// Control-plane transport
//
// Where tracepoint sets come from and where finished snapshots go. The
// engine never depends on a concrete wire; the agent binary supplies a
// stdio implementation and tests use MemoryTransport.

use crate::error::EngineResult;
use crate::model::EventSnapshot;
use crate::tracepoint::TracepointDefinition;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A complete, server-authoritative tracepoint set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracepointUpdate {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub tracepoints: Vec<TracepointDefinition>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// The latest set, or None when it is unchanged from `current_hash`
    async fn fetch_update(&self, current_hash: Option<&str>) -> EngineResult<Option<TracepointUpdate>>;

    /// Deliver one snapshot; callers log failures and move on
    async fn send(&self, snapshot: EventSnapshot) -> EngineResult<()>;
}

/// Queue-backed transport for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pending: Mutex<VecDeque<TracepointUpdate>>,
    sent: Mutex<Vec<EventSnapshot>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_update(&self, update: TracepointUpdate) {
        self.pending.lock().push_back(update);
    }

    pub fn take_sent(&self) -> Vec<EventSnapshot> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_update(&self, current_hash: Option<&str>) -> EngineResult<Option<TracepointUpdate>> {
        let next = self.pending.lock().pop_front();
        Ok(next.filter(|update| update.hash.is_none() || update.hash.as_deref() != current_hash))
    }

    async fn send(&self, snapshot: EventSnapshot) -> EngineResult<()> {
        self.sent.lock().push(snapshot);
        Ok(())
    }
}
