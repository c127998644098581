// Stdio transport
//
// Updates arrive on stdin and wait here until the poller asks for them;
// snapshots and replies are written to stdout as line-delimited JSON.

use crate::protocol::Event;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracehook_engine::error::{EngineError, EngineResult};
use tracehook_engine::transport::{TracepointUpdate, Transport};
use tracehook_engine::EventSnapshot;
use tracing::debug;

pub struct StdioTransport<W> {
    pending: Mutex<Option<TracepointUpdate>>,
    out: Mutex<W>,
}

impl<W: AsyncWrite + Send + Unpin> StdioTransport<W> {
    pub fn new(out: W) -> Self {
        Self {
            pending: Mutex::new(None),
            out: Mutex::new(out),
        }
    }

    /// Hold `update` for the next poll; a newer update replaces an unpolled one
    pub async fn queue_update(&self, update: TracepointUpdate) {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("Replacing unpolled tracepoint update");
        }
        *pending = Some(update);
    }

    pub async fn write_event(&self, event: &Event) -> EngineResult<()> {
        let line = serde_json::to_string(event)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> Transport for StdioTransport<W> {
    async fn fetch_update(&self, current_hash: Option<&str>) -> EngineResult<Option<TracepointUpdate>> {
        let update = self.pending.lock().await.take();
        Ok(update.filter(|u| u.hash.is_none() || u.hash.as_deref() != current_hash))
    }

    async fn send(&self, snapshot: EventSnapshot) -> EngineResult<()> {
        self.write_event(&Event::Snapshot { snapshot })
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

#[cfg(test)]
impl StdioTransport<Vec<u8>> {
    pub async fn written(&self) -> String {
        String::from_utf8_lossy(&self.out.lock().await).into_owned()
    }
}
