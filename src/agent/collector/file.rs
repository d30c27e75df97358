use super::{generate_entry_id, Collector, CollectorCore, CollectorError, CollectorStats};
use crate::agent::tailer::{FileTailer, TailerConfig};
use crate::model::{LogEntry, LogLevel};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FileCollectorConfig {
    /// Glob patterns of files to tail.
    pub paths: Vec<String>,
    /// Glob patterns matched against file names to skip.
    pub exclude: Vec<String>,
    pub state_file: PathBuf,
    pub source: String,
    pub host: String,
}

/// Tails files matched by the configured globs and turns each appended
/// line into a log entry.
pub struct FileCollector {
    core: Arc<CollectorCore>,
    config: FileCollectorConfig,
    output_rx: Option<mpsc::Receiver<LogEntry>>,
    tailer: Option<Arc<FileTailer>>,
    forward_task: Option<JoinHandle<()>>,
}

impl FileCollector {
    pub fn new(name: String, config: FileCollectorConfig) -> Self {
        let (core, output_rx) = CollectorCore::new(name, "file", 1000);
        Self {
            core,
            config,
            output_rx: Some(output_rx),
            tailer: None,
            forward_task: None,
        }
    }

    fn expand_paths(&self) -> Result<Vec<PathBuf>, CollectorError> {
        let excludes: Vec<glob::Pattern> = self
            .config
            .exclude
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        let mut matches = Vec::new();
        for pattern in &self.config.paths {
            for path in glob::glob(pattern)?.flatten() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if excludes.iter().any(|p| p.matches(&name)) {
                    continue;
                }
                matches.push(path);
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl Collector for FileCollector {
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        if self.tailer.is_some() {
            return Err(CollectorError::AlreadyStarted);
        }

        let (line_tx, mut line_rx) = mpsc::channel::<String>(1000);
        let tailer_config = TailerConfig {
            state_file: self.config.state_file.clone(),
            ..TailerConfig::default()
        };
        let tailer = FileTailer::new(tailer_config, line_tx)?;

        let files = self.expand_paths()?;
        info!(
            collector = %self.core.stats().name,
            files = files.len(),
            "file collector starting"
        );
        for path in files {
            if let Err(e) = tailer.add_file(&path) {
                self.core.record_error(&e);
                warn!(path = %path.display(), error = %e, "failed to add file");
            }
        }
        tailer.start();

        let core = Arc::clone(&self.core);
        let source = self.config.source.clone();
        let host = self.config.host.clone();
        let mut shutdown = shutdown;
        self.forward_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    line = line_rx.recv() => {
                        match line {
                            Some(line) => {
                                let mut entry = LogEntry::new();
                                entry.id = generate_entry_id(&source, &line);
                                entry.message = line.clone();
                                entry.raw = line;
                                entry.source = source.clone();
                                entry.host = host.clone();
                                entry.level = LogLevel::Info;
                                entry.timestamp = Utc::now();
                                core.emit(entry);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        self.tailer = Some(tailer);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CollectorError> {
        if let Some(tailer) = self.tailer.take() {
            tailer.stop().await?;
        }
        if let Some(task) = self.forward_task.take() {
            // The tailer owned the line sender; with it gone the forward
            // task drains and exits on channel close.
            let _ = task.await;
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>> {
        self.output_rx.take()
    }

    fn name(&self) -> &str {
        &self.config.source
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn stats(&self) -> CollectorStats {
        self.core.stats()
    }
}
