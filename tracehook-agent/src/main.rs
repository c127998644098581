// Tracehook agent - dynamic tracepoints over a stdio control channel
//
// Hosts an in-memory class runtime, applies tracepoint updates through the
// poller and streams captured snapshots back as line-delimited JSON.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracehook_engine::poller::{spawn_snapshot_drain, TracepointPoller};
use tracehook_engine::transport::TracepointUpdate;
use tracehook_engine::AgentConfig;
use tracing::{debug, error, info, warn};

mod protocol;
mod session;
mod transport;

use protocol::{Event, Request};
use session::AgentSession;
use transport::StdioTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("tracehook=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    info!("Starting tracehook agent...");

    let config = AgentConfig::from_env()?;
    let transport = Arc::new(StdioTransport::new(tokio::io::stdout()));
    let (session, snapshots) = AgentSession::new(&config);

    let poller = Arc::new(TracepointPoller::new(session.registry(), transport.clone()));
    let polling = poller.clone().start(config.poll_interval());
    let drain = spawn_snapshot_drain(snapshots, transport.clone());

    let mut reader = BufReader::new(tokio::io::stdin());

    info!("Tracehook agent ready, waiting for requests...");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Control channel closed");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                debug!("Received: {}", line);

                let reply = match serde_json::from_str::<Request>(line) {
                    Ok(Request::Update { hash, tracepoints }) => {
                        transport.queue_update(TracepointUpdate { hash, tracepoints }).await;
                        match poller.poll_once().await {
                            Ok(_) => None,
                            Err(e) => Some(Event::Error { message: e.to_string() }),
                        }
                    }
                    Ok(request) => Some(session.handle(request)),
                    Err(e) => {
                        error!("Invalid request: {}", e);
                        Some(Event::Error {
                            message: format!("invalid request: {}", e),
                        })
                    }
                };

                if let Some(reply) = reply {
                    transport.write_event(&reply).await?;
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    let ticks = polling.shutdown().await;
    debug!("Poller ran {} ticks", ticks);

    // the drain ends once every sender is gone
    drop(session);
    match drain.await {
        Ok(delivered) => info!("Delivered {} snapshots", delivered),
        Err(e) => warn!("Snapshot drain failed: {}", e),
    }

    info!("Tracehook agent shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use tracehook_engine::AgentConfig;

    #[test]
    fn test_config_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"poll_interval_ms": 500, "sink_capacity": 8, "resource": {{"service": "orders"}}}}"#
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("TRACEHOOK_CONFIG", file.path().to_string_lossy().into_owned());
        env.insert("TRACEHOOK_POLL_INTERVAL_MS", "250".to_string());

        let config = AgentConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.sink_capacity, 8);
        assert_eq!(config.resource.get("service").map(String::as_str), Some("orders"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let result = AgentConfig::from_lookup(|key| {
            (key == "TRACEHOOK_CONFIG").then(|| missing.to_string_lossy().into_owned())
        });
        assert!(result.is_err());
    }
}
