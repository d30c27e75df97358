pub mod file;
pub mod http;
pub mod syslog;

pub use file::FileCollector;
pub use http::HttpCollector;
pub use syslog::SyslogCollector;

use crate::agent::tailer::TailerError;
use crate::config::types::{InputConfig, InputType};
use crate::model::LogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::warn;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tailer error: {0}")]
    Tailer(#[from] TailerError),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("collector already started")]
    AlreadyStarted,
}

impl std::fmt::Debug for dyn Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Collector")
    }
}

/// A pluggable log source. Implementations push entries into their
/// output channel until stopped.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), CollectorError>;

    async fn stop(&mut self) -> Result<(), CollectorError>;

    /// Hands the single consumer end of the output channel to the
    /// caller. Yields `None` after the first call.
    fn take_output(&mut self) -> Option<mpsc::Receiver<LogEntry>>;

    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    fn stats(&self) -> CollectorStats;
}

/// Builds a collector from an input config, keyed on the `type` tag.
pub fn new_collector(
    input: &InputConfig,
    host: &str,
    state_dir: &PathBuf,
) -> Result<Box<dyn Collector>, CollectorError> {
    let name = if input.name.is_empty() {
        format!("{:?}", input.input_type).to_lowercase()
    } else {
        input.name.clone()
    };

    match input.input_type {
        InputType::File => {
            let config = file::FileCollectorConfig {
                paths: input.paths.clone(),
                exclude: input.exclude.clone(),
                state_file: state_dir.join(format!("tailer-{}.json", name)),
                source: name.clone(),
                host: host.to_string(),
            };
            Ok(Box::new(FileCollector::new(name, config)))
        }
        InputType::Syslog => {
            let address = input
                .address
                .clone()
                .ok_or(CollectorError::MissingSetting("address"))?;
            let config = syslog::SyslogCollectorConfig {
                address,
                protocol: input.protocol.unwrap_or(crate::config::types::SyslogProtocol::Udp),
                source: name.clone(),
                host: host.to_string(),
            };
            Ok(Box::new(SyslogCollector::new(name, config)))
        }
        InputType::Http => {
            let listen_address = input
                .listen_address
                .clone()
                .ok_or(CollectorError::MissingSetting("listen_address"))?;
            let config = http::HttpCollectorConfig {
                listen_address,
                auth_token: input.auth_token.clone(),
                source: name.clone(),
                host: host.to_string(),
            };
            Ok(Box::new(HttpCollector::new(name, config)))
        }
    }
}

/// Observational runtime counters for one collector. Never
/// authoritative; purely for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub name: String,
    pub kind: String,
    pub logs_collected: u64,
    pub bytes_collected: u64,
    pub dropped: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Shared plumbing for collectors: the bounded output channel plus the
/// telemetry counters behind it.
pub struct CollectorCore {
    name: String,
    kind: &'static str,
    output_tx: mpsc::Sender<LogEntry>,
    logs: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_active: Mutex<Option<DateTime<Utc>>>,
}

impl CollectorCore {
    pub fn new(
        name: String,
        kind: &'static str,
        channel_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<LogEntry>) {
        let (output_tx, output_rx) = mpsc::channel(channel_capacity);
        let core = Arc::new(Self {
            name,
            kind,
            output_tx,
            logs: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_active: Mutex::new(None),
        });
        (core, output_rx)
    }

    /// Non-blocking emit; a full channel drops the entry and counts it
    /// rather than stalling the source.
    pub fn emit(&self, entry: LogEntry) {
        let raw_len = entry.raw.len() as u64;
        match self.output_tx.try_send(entry) {
            Ok(()) => {
                self.logs.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(raw_len, Ordering::Relaxed);
                *self.last_active.lock().unwrap() = Some(Utc::now());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(collector = %self.name, "output channel full, dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_error(&self, error: impl ToString) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            name: self.name.clone(),
            kind: self.kind.to_string(),
            logs_collected: self.logs.load(Ordering::Relaxed),
            bytes_collected: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap().clone(),
            last_active: *self.last_active.lock().unwrap(),
        }
    }
}

/// Deterministic entry identifier: MD5 over source, a nanosecond
/// timestamp and the payload.
pub fn generate_entry_id(source: &str, payload: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{:x}", md5::compute(format!("{}:{}:{}", source, nanos, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_entry_id_shape_and_uniqueness() {
        let a = generate_entry_id("src", "line one");
        let b = generate_entry_id("src", "line one");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // The nanosecond component keeps identical payloads distinct.
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_core_emit_counts_and_drops() {
        let (core, mut rx) = CollectorCore::new("t".to_string(), "file", 1);

        let mut entry = LogEntry::new();
        entry.raw = "12345".to_string();
        core.emit(entry.clone());
        core.emit(entry.clone()); // channel full, dropped

        let stats = core.stats();
        assert_eq!(stats.logs_collected, 1);
        assert_eq!(stats.bytes_collected, 5);
        assert_eq!(stats.dropped, 1);
        assert!(stats.last_active.is_some());

        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_factory_requires_type_specific_settings() {
        use crate::config::types::*;
        let input = InputConfig {
            input_type: InputType::Syslog,
            name: "s".to_string(),
            enabled: true,
            paths: vec![],
            exclude: vec![],
            multiline: None,
            address: None,
            protocol: None,
            endpoint: None,
            containers: vec![],
            namespace: None,
            labels: Default::default(),
            listen_address: None,
            tls: false,
            auth_token: None,
        };
        let err = new_collector(&input, "host", &PathBuf::from("/tmp")).unwrap_err();
        assert!(matches!(err, CollectorError::MissingSetting("address")));
    }
}
