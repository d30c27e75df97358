use crate::agent::buffer::{new_buffer, Buffer, BufferError};
use crate::agent::collector::{new_collector, Collector, CollectorError};
use crate::agent::shipper::{ShipError, Shipper, ShipperConfig};
use crate::config::types::AgentConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("shipper error: {0}")]
    Shipper(#[from] ShipError),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wires collectors, buffer and shipper together and supervises their
/// lifecycle: collectors fill the buffer, a drain loop moves buffered
/// entries into the shipper and removes them once the shipper has
/// accepted them.
pub struct AgentRunner {
    config: AgentConfig,
    buffer: Arc<dyn Buffer>,
    shipper: Arc<Shipper>,
    collectors: Vec<Box<dyn Collector>>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let buffer = new_buffer(&config.buffer)?;

        let shipper_config = ShipperConfig {
            endpoints: config.output.hosts.clone(),
            compression: config.output.compression.clone(),
            batch_size: config.output.batch_size,
            batch_timeout: config.output.batch_timeout,
            max_retries: config.output.max_retries,
            api_key: config.output.api_key.clone(),
            ..ShipperConfig::default()
        };
        let shipper = Shipper::new(shipper_config, config.agent.id.clone())?;

        let state_dir = config.buffer.path.clone();
        let mut collectors = Vec::new();
        for input in config.inputs.iter().filter(|i| i.enabled) {
            match new_collector(input, &config.agent.id, &state_dir) {
                Ok(collector) => collectors.push(collector),
                Err(e) => {
                    // A single bad input does not keep the agent down.
                    warn!(input = %input.name, error = %e, "skipping collector");
                }
            }
        }

        Ok(Self {
            config,
            buffer,
            shipper,
            collectors,
        })
    }

    /// Runs until SIGINT/SIGTERM, then shuts the dataflow down in
    /// dependency order.
    pub async fn run(mut self) -> Result<(), AgentError> {
        if self.collectors.is_empty() {
            return Err(CollectorError::MissingSetting("at least one enabled input").into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut forward_tasks: Vec<JoinHandle<()>> = Vec::new();

        for collector in self.collectors.iter_mut() {
            let Some(mut output) = collector.take_output() else {
                continue;
            };
            collector.start(shutdown_rx.clone()).await?;
            info!(name = %collector.name(), kind = collector.kind(), "collector started");

            let buffer = Arc::clone(&self.buffer);
            let mut task_shutdown = shutdown_rx.clone();
            forward_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        entry = output.recv() => {
                            match entry {
                                Some(entry) => {
                                    if let Err(e) = buffer.add(entry) {
                                        warn!(error = %e, "failed to buffer entry");
                                    }
                                }
                                None => break,
                            }
                        }
                        _ = task_shutdown.changed() => break,
                    }
                }
            }));
        }

        let drain_task = {
            let buffer = Arc::clone(&self.buffer);
            let shipper = Arc::clone(&self.shipper);
            let batch_size = self.config.output.batch_size;
            let mut task_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(100));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            drain_once(&buffer, &shipper, batch_size);
                        }
                        _ = task_shutdown.changed() => break,
                    }
                }
            })
        };

        let heartbeat_task = {
            let interval = self.config.agent.heartbeat_interval;
            let agent_id = self.config.agent.id.clone();
            let shipper = Arc::clone(&self.shipper);
            let buffer = Arc::clone(&self.buffer);
            let mut task_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // First tick fires immediately; skip it.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let ship_stats = shipper.stats();
                            info!(
                                agent = %agent_id,
                                buffered = buffer.len(),
                                queue_depth = ship_stats.queue_depth,
                                batches_dropped = ship_stats.batches_dropped,
                                "heartbeat"
                            );
                        }
                        _ = task_shutdown.changed() => break,
                    }
                }
            })
        };

        info!(
            agent = %self.config.agent.id,
            collectors = self.collectors.len(),
            endpoints = ?self.config.output.hosts,
            "agent started"
        );

        wait_for_signal().await;
        info!("shutdown signal received, stopping agent");
        let _ = shutdown_tx.send(true);

        for collector in self.collectors.iter_mut() {
            if let Err(e) = collector.stop().await {
                error!(name = %collector.name(), error = %e, "error stopping collector");
            }
        }
        for task in forward_tasks {
            let _ = task.await;
        }
        let _ = drain_task.await;
        let _ = heartbeat_task.await;

        // Push whatever is still buffered into the shipper, then let the
        // shipper flush its residual batch within the grace period.
        drain_once(&self.buffer, &self.shipper, self.config.output.batch_size);
        if tokio::time::timeout(Duration::from_secs(10), self.shipper.close())
            .await
            .is_err()
        {
            warn!("shipper did not flush within the shutdown grace period");
        }

        if let Err(e) = self.buffer.close() {
            error!(error = %e, "error closing buffer");
        }

        info!("agent stopped");
        Ok(())
    }
}

/// Moves up to `batch_size` entries from the buffer into the shipper.
/// Entries are removed from the buffer only once the shipper has taken
/// ownership; a saturated shipper leaves the rest for the next cycle.
fn drain_once(buffer: &Arc<dyn Buffer>, shipper: &Arc<Shipper>, batch_size: usize) {
    let entries = buffer.get(batch_size);
    if entries.is_empty() {
        return;
    }

    let mut accepted = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = entry.id.clone();
        match shipper.ship(entry) {
            Ok(()) => accepted.push(id),
            Err(ShipError::QueueFull) => break,
            Err(e) => {
                warn!(error = %e, "shipper rejected entry");
                break;
            }
        }
    }
    if !accepted.is_empty() {
        buffer.remove(&accepted);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::buffer::MemoryBuffer;
    use crate::model::LogEntry;
    use tempfile::TempDir;

    fn entry(id: &str) -> LogEntry {
        let mut e = LogEntry::new();
        e.id = id.to_string();
        e
    }

    #[tokio::test]
    async fn test_drain_removes_only_accepted_entries() {
        let dir = TempDir::new().unwrap();
        let buffer: Arc<dyn Buffer> =
            Arc::new(MemoryBuffer::new(100, dir.path().to_path_buf()));

        // Queue capacity is batch_size * 2 = 2 and nothing consumes it
        // quickly (dead endpoint, huge backoff), so most entries must
        // stay buffered.
        let shipper = Shipper::new(
            ShipperConfig {
                endpoints: vec!["http://127.0.0.1:1".to_string()],
                batch_size: 1,
                batch_timeout: Duration::from_secs(3600),
                retry_backoff: Duration::from_secs(3600),
                ..Default::default()
            },
            "agent-test",
        )
        .unwrap();

        for i in 0..10 {
            buffer.add(entry(&format!("e{}", i))).unwrap();
        }

        drain_once(&buffer, &shipper, 10);
        let remaining = buffer.len();
        assert!(remaining >= 7, "only queue-accepted entries leave the buffer");
        assert!(remaining < 10, "some entries must have been handed over");

        // A later cycle hands over nothing new while the queue is full.
        drain_once(&buffer, &shipper, 10);
        assert!(buffer.len() <= remaining);
    }
}
