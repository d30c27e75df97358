use crate::config::types::{BufferConfig, BufferType};
use crate::model::LogEntry;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer is full")]
    Full,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Staging area between collectors and the shipper.
///
/// `get` is non-destructive; callers remove entries only after the
/// downstream hop has accepted them, so an unacknowledged entry is never
/// lost to a crash of the consumer.
pub trait Buffer: Send + Sync {
    fn add(&self, entry: LogEntry) -> Result<(), BufferError>;

    fn add_batch(&self, entries: Vec<LogEntry>) -> Result<(), BufferError>;

    /// Returns up to `limit` entries without removing them.
    fn get(&self, limit: usize) -> Vec<LogEntry>;

    /// Removes entries by id after downstream acknowledgement.
    fn remove(&self, ids: &[String]);

    fn len(&self) -> usize;

    fn close(&self) -> Result<(), BufferError>;
}

/// Builds a buffer from configuration, keyed on the `type` tag.
pub fn new_buffer(config: &BufferConfig) -> Result<Arc<dyn Buffer>, BufferError> {
    match config.buffer_type {
        BufferType::Memory => Ok(Arc::new(MemoryBuffer::new(
            config.size as usize,
            config.path.clone(),
        ))),
        BufferType::Disk => Ok(DiskBuffer::new(
            config.path.clone(),
            config.size,
            config.flush_interval,
            1000,
        )?),
    }
}

fn nanos_now() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Bounded in-memory buffer. On overflow the current contents are
/// spilled to a timestamped JSON file and cleared, preserving order and
/// leaving a crash-visible trail instead of blocking producers.
pub struct MemoryBuffer {
    max_entries: usize,
    overflow_dir: PathBuf,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryBuffer {
    pub fn new(max_entries: usize, path: PathBuf) -> Self {
        Self {
            max_entries: max_entries.max(1),
            overflow_dir: path.join("overflow"),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn spill_locked(&self, entries: &mut Vec<LogEntry>) -> Result<(), BufferError> {
        if entries.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.overflow_dir)?;
        let filename = self.overflow_dir.join(format!("overflow_{}.json", nanos_now()));
        let data = serde_json::to_vec(&entries)?;
        std::fs::write(&filename, data)?;

        warn!(
            spilled = entries.len(),
            file = %filename.display(),
            "memory buffer full, spilled to disk"
        );
        entries.clear();
        Ok(())
    }
}

impl Buffer for MemoryBuffer {
    fn add(&self, entry: LogEntry) -> Result<(), BufferError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries {
            self.spill_locked(&mut entries)?;
        }
        entries.push(entry);
        Ok(())
    }

    fn add_batch(&self, batch: Vec<LogEntry>) -> Result<(), BufferError> {
        let mut entries = self.entries.lock().unwrap();
        for entry in batch {
            if entries.len() >= self.max_entries {
                self.spill_locked(&mut entries)?;
            }
            entries.push(entry);
        }
        Ok(())
    }

    fn get(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        entries.iter().take(limit).cloned().collect()
    }

    fn remove(&self, ids: &[String]) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| !ids.contains(&e.id));
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn close(&self) -> Result<(), BufferError> {
        Ok(())
    }
}

/// Write-ahead buffer: entries accumulate in memory and are flushed to
/// timestamped JSON segments, either when the in-memory window reaches
/// `max_batch_size` or on the flush interval. Flushed segments survive a
/// crash; the in-memory window does not — the shipper holds the
/// authoritative copy of unacknowledged entries.
pub struct DiskBuffer {
    path: PathBuf,
    max_size: u64,
    max_batch_size: usize,
    inner: Mutex<DiskInner>,
    shutdown_tx: watch::Sender<bool>,
}

struct DiskInner {
    entries: Vec<LogEntry>,
    current_size: u64,
}

impl DiskBuffer {
    pub fn new(
        path: PathBuf,
        max_size: u64,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Result<Arc<Self>, BufferError> {
        std::fs::create_dir_all(&path)?;

        let current_size = segment_files(&path)?
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let buffer = Arc::new(Self {
            path,
            max_size,
            max_batch_size: max_batch_size.max(1),
            inner: Mutex::new(DiskInner {
                entries: Vec::new(),
                current_size,
            }),
            shutdown_tx,
        });

        let flusher = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut inner = flusher.inner.lock().unwrap();
                        if let Err(e) = flusher.flush_locked(&mut inner) {
                            error!(error = %e, "periodic buffer flush failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(buffer)
    }

    fn flush_locked(&self, inner: &mut DiskInner) -> Result<(), BufferError> {
        if inner.entries.is_empty() {
            return Ok(());
        }

        let filename = self.path.join(format!("buffer_{}.json", nanos_now()));
        let data = serde_json::to_vec(&inner.entries)?;
        std::fs::write(&filename, &data)?;

        debug!(
            entries = inner.entries.len(),
            bytes = data.len(),
            file = %filename.display(),
            "flushed buffer segment"
        );

        inner.current_size += data.len() as u64;
        inner.entries.clear();

        if inner.current_size > self.max_size {
            self.cleanup_locked(inner)?;
        }
        Ok(())
    }

    /// Coarse retention: drop whole segments oldest-first until the
    /// aggregate size is back under the limit.
    fn cleanup_locked(&self, inner: &mut DiskInner) -> Result<(), BufferError> {
        let mut files = segment_files(&self.path)?;
        files.sort();

        for file in files {
            if inner.current_size <= self.max_size {
                break;
            }
            let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            if std::fs::remove_file(&file).is_ok() {
                warn!(file = %file.display(), "dropped oldest buffer segment over size limit");
                inner.current_size = inner.current_size.saturating_sub(size);
            }
        }
        Ok(())
    }
}

impl Buffer for DiskBuffer {
    fn add(&self, entry: LogEntry) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push(entry);
        if inner.entries.len() >= self.max_batch_size {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    fn add_batch(&self, batch: Vec<LogEntry>) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.extend(batch);
        if inner.entries.len() >= self.max_batch_size {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    fn get(&self, limit: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().take(limit).cloned().collect()
    }

    fn remove(&self, ids: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| !ids.contains(&e.id));
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    fn close(&self) -> Result<(), BufferError> {
        let _ = self.shutdown_tx.send(true);
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)
    }
}

fn segment_files(path: &Path) -> Result<Vec<PathBuf>, BufferError> {
    let mut files = Vec::new();
    for dir_entry in std::fs::read_dir(path)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("buffer_") && name.ends_with(".json") {
            files.push(dir_entry.path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str) -> LogEntry {
        let mut e = LogEntry::new();
        e.id = id.to_string();
        e.message = format!("message for {}", id);
        e
    }

    #[test]
    fn test_memory_get_is_non_destructive() {
        let dir = TempDir::new().unwrap();
        let buffer = MemoryBuffer::new(10, dir.path().to_path_buf());

        buffer.add(entry("a")).unwrap();
        buffer.add(entry("b")).unwrap();

        assert_eq!(buffer.get(10).len(), 2);
        assert_eq!(buffer.len(), 2);

        buffer.remove(&["a".to_string()]);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(10)[0].id, "b");
    }

    #[test]
    fn test_memory_overflow_spills_and_clears() {
        let dir = TempDir::new().unwrap();
        let buffer = MemoryBuffer::new(3, dir.path().to_path_buf());

        for i in 0..3 {
            buffer.add(entry(&format!("e{}", i))).unwrap();
        }
        // Fourth add triggers the spill.
        buffer.add(entry("e3")).unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(10)[0].id, "e3");

        let overflow: Vec<PathBuf> = std::fs::read_dir(dir.path().join("overflow"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(overflow.len(), 1);

        let spilled: Vec<LogEntry> =
            serde_json::from_slice(&std::fs::read(&overflow[0]).unwrap()).unwrap();
        let ids: Vec<&str> = spilled.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e0", "e1", "e2"]);
    }

    #[tokio::test]
    async fn test_disk_flushes_at_batch_size() {
        let dir = TempDir::new().unwrap();
        let buffer = DiskBuffer::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_secs(3600),
            3,
        )
        .unwrap();

        buffer.add(entry("a")).unwrap();
        buffer.add(entry("b")).unwrap();
        assert_eq!(segment_files(dir.path()).unwrap().len(), 0);

        buffer.add(entry("c")).unwrap();
        assert_eq!(segment_files(dir.path()).unwrap().len(), 1);
        assert_eq!(buffer.len(), 0);
    }

    #[tokio::test]
    async fn test_disk_background_flush() {
        let dir = TempDir::new().unwrap();
        let buffer = DiskBuffer::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_millis(50),
            1000,
        )
        .unwrap();

        buffer.add(entry("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(segment_files(dir.path()).unwrap().len(), 1);
        assert_eq!(buffer.len(), 0);
        buffer.close().unwrap();
    }

    #[tokio::test]
    async fn test_disk_close_performs_final_flush() {
        let dir = TempDir::new().unwrap();
        let buffer = DiskBuffer::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_secs(3600),
            1000,
        )
        .unwrap();

        buffer.add(entry("a")).unwrap();
        buffer.close().unwrap();

        let files = segment_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let flushed: Vec<LogEntry> =
            serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
        assert_eq!(flushed[0].id, "a");
    }

    #[tokio::test]
    async fn test_disk_retention_drops_oldest_segments() {
        let dir = TempDir::new().unwrap();
        let buffer = DiskBuffer::new(
            dir.path().to_path_buf(),
            // Tiny cap so every flush overflows it.
            64,
            Duration::from_secs(3600),
            1,
        )
        .unwrap();

        for i in 0..5 {
            buffer.add(entry(&format!("e{}", i))).unwrap();
        }

        let files = segment_files(dir.path()).unwrap();
        assert!(
            files.len() < 5,
            "expected old segments to be dropped, have {}",
            files.len()
        );
        buffer.close().unwrap();
    }

    #[tokio::test]
    async fn test_factory_dispatch() {
        let dir = TempDir::new().unwrap();
        let config = BufferConfig {
            buffer_type: BufferType::Disk,
            size: 1024,
            path: dir.path().to_path_buf(),
            flush_interval: Duration::from_secs(60),
        };
        let buffer = new_buffer(&config).unwrap();
        buffer.add(entry("x")).unwrap();
        assert_eq!(buffer.len(), 1);
        buffer.close().unwrap();
    }
}
