use crate::config::types::PipelineConfig;
use crate::model::LogEntry;
use crate::parser::{new_parser, ParseError, Parser};
use crate::server::processor::{new_processor, ProcessError, Processor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("parser error: {0}")]
    Parser(#[from] ParseError),

    #[error("processor error: {0}")]
    Processor(#[from] ProcessError),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    #[serde(with = "average_latency_micros")]
    pub average_latency: Duration,
    pub last_processed: Option<DateTime<Utc>>,
}

mod average_latency_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}

/// A named processing stage: one optional parser followed by an ordered
/// processor chain, executed by a pool of workers draining a single
/// shared inbound channel.
pub struct Pipeline {
    name: String,
    parser: Option<Box<dyn Parser>>,
    processors: Vec<Box<dyn Processor>>,
    stats: Mutex<PipelineStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn from_config(config: &PipelineConfig) -> Result<Arc<Self>, PipelineError> {
        let parser = config
            .parser
            .as_ref()
            .map(|spec| new_parser(&spec.to_parser_config()))
            .transpose()?;

        let mut processors = Vec::with_capacity(config.processors.len());
        for proc_config in &config.processors {
            match new_processor(proc_config) {
                Ok(processor) => processors.push(processor),
                Err(e) => {
                    // One bad processor degrades the chain, it does not
                    // kill the pipeline.
                    warn!(
                        pipeline = %config.name,
                        processor = %proc_config.processor_type,
                        error = %e,
                        "skipping processor"
                    );
                }
            }
        }

        Ok(Arc::new(Self {
            name: config.name.clone(),
            parser,
            processors,
            stats: Mutex::new(PipelineStats::default()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().unwrap().clone()
    }

    /// Spawns `workers` tasks over the shared inbound channel.
    pub fn start(
        self: &Arc<Self>,
        workers: usize,
        inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<LogEntry>>>,
        outbound: mpsc::Sender<LogEntry>,
        shutdown: watch::Receiver<bool>,
    ) {
        let workers = workers.max(1);
        info!(pipeline = %self.name, workers, "starting pipeline workers");

        let mut tasks = self.tasks.lock().unwrap();
        for worker_id in 0..workers {
            let pipeline = Arc::clone(self);
            let inbound = Arc::clone(&inbound);
            let outbound = outbound.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                pipeline.worker(worker_id, inbound, outbound, shutdown).await;
            }));
        }
    }

    /// Waits for every worker to finish.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(pipeline = %self.name, "pipeline stopped");
    }

    async fn worker(
        &self,
        worker_id: usize,
        inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<LogEntry>>>,
        outbound: mpsc::Sender<LogEntry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(pipeline = %self.name, worker_id, "worker started");
        loop {
            // Hold the receiver lock only while waiting for one entry.
            let entry = {
                let mut rx = inbound.lock().await;
                tokio::select! {
                    entry = rx.recv() => entry,
                    _ = shutdown.changed() => None,
                }
            };

            let Some(mut entry) = entry else {
                break;
            };

            let start = Instant::now();
            if let Err(e) = self.process_entry(&mut entry) {
                if !matches!(e, PipelineError::Processor(ProcessError::Filtered)) {
                    debug!(pipeline = %self.name, error = %e, "entry failed processing");
                }
                self.record_failure();
                continue;
            }

            match outbound.try_send(entry) {
                Ok(()) => self.record_success(start.elapsed()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.record_drop();
                    warn!(pipeline = %self.name, "outbound channel full, dropping entry");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        debug!(pipeline = %self.name, worker_id, "worker exited");
    }

    fn process_entry(&self, entry: &mut LogEntry) -> Result<(), PipelineError> {
        if let Some(parser) = &self.parser {
            parser.parse(entry)?;
        }
        for processor in &self.processors {
            processor.process(entry)?;
        }
        Ok(())
    }

    fn record_success(&self, latency: Duration) {
        let mut stats = self.stats.lock().unwrap();
        stats.processed += 1;
        stats.last_processed = Some(Utc::now());
        stats.average_latency = if stats.average_latency.is_zero() {
            latency
        } else {
            (stats.average_latency + latency) / 2
        };
    }

    fn record_failure(&self) {
        self.stats.lock().unwrap().failed += 1;
    }

    fn record_drop(&self) {
        self.stats.lock().unwrap().dropped += 1;
    }
}
