use crate::model::{LogEntry, SearchQuery, SearchResult};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const PARTITION_PREFIX: &str = "partition_";
const PARTITION_EXT: &str = "seg";
const PARTITION_KEY_FORMAT: &str = "%Y-%m-%d-%H";
// Sanity cap on a single encoded record; anything larger means a
// corrupt frame header.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("entry not found")]
    NotFound,

    #[error("corrupt partition {0}: record length {1} exceeds limit")]
    CorruptFrame(PathBuf, u32),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub partition_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/logpipe/data"),
            partition_interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_entries: u64,
    pub total_bytes: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub partitions: usize,
}

/// One time bucket: an append-only segment file of length-prefixed
/// JSON-encoded records. The length prefix makes every record
/// addressable by byte offset without a self-describing binary codec.
struct Partition {
    path: PathBuf,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    append: Mutex<AppendHandle>,
}

struct AppendHandle {
    file: File,
    offset: u64,
}

struct IndexEntry {
    partition: PathBuf,
    offset: u64,
    #[allow(dead_code)]
    timestamp: DateTime<Utc>,
}

struct StoreInner {
    partitions: HashMap<String, Arc<Partition>>,
    stats: StoreStats,
}

/// Time-partitioned log store. One mutex guards the partition map and
/// aggregate stats; each partition's append handle has its own mutex.
/// The id index lives in memory and is rebuilt by scanning segments at
/// startup, so lookups work across process restarts.
pub struct FileStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl FileStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;

        let store = Self {
            config,
            inner: Mutex::new(StoreInner {
                partitions: HashMap::new(),
                stats: StoreStats::default(),
            }),
            index: Mutex::new(HashMap::new()),
        };
        store.load_partitions()?;
        Ok(store)
    }

    /// Appends an entry to its time partition and indexes it by id.
    pub fn write(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let partition = self.partition_for(&mut inner, entry.timestamp)?;

        let encoded = serde_json::to_vec(entry)?;
        let offset = {
            let mut append = partition.append.lock().unwrap();
            let offset = append.offset;
            append.file.write_all(&(encoded.len() as u32).to_le_bytes())?;
            append.file.write_all(&encoded)?;
            append.offset += 4 + encoded.len() as u64;
            offset
        };

        self.index.lock().unwrap().insert(
            entry.id.clone(),
            IndexEntry {
                partition: partition.path.clone(),
                offset,
                timestamp: entry.timestamp,
            },
        );

        let stats = &mut inner.stats;
        stats.total_entries += 1;
        stats.total_bytes += 4 + encoded.len() as u64;
        if stats
            .oldest_entry
            .map(|oldest| entry.timestamp < oldest)
            .unwrap_or(true)
        {
            stats.oldest_entry = Some(entry.timestamp);
        }
        if stats
            .newest_entry
            .map(|newest| entry.timestamp > newest)
            .unwrap_or(true)
        {
            stats.newest_entry = Some(entry.timestamp);
        }

        Ok(())
    }

    pub fn write_batch(&self, entries: &[LogEntry]) -> Result<(), StoreError> {
        for entry in entries {
            self.write(entry)?;
        }
        Ok(())
    }

    /// O(1) index lookup followed by a single seek-and-decode.
    pub fn get(&self, id: &str) -> Result<LogEntry, StoreError> {
        let (path, offset) = {
            let index = self.index.lock().unwrap();
            let idx = index.get(id).ok_or(StoreError::NotFound)?;
            (idx.partition.clone(), idx.offset)
        };

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        match read_frame(&mut file, &path)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound),
        }
    }

    /// Scans partitions overlapping the query's time range, filtering on
    /// time containment and a case-insensitive substring match against
    /// the message. Stops once `limit` hits have accumulated.
    pub fn query(&self, query: &SearchQuery) -> Result<SearchResult, StoreError> {
        let started = std::time::Instant::now();

        let mut partitions: Vec<Arc<Partition>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .partitions
                .values()
                .filter(|p| p.start < query.time_range.end && p.end > query.time_range.start)
                .cloned()
                .collect()
        };
        partitions.sort_by_key(|p| p.start);

        let needle = query.query.to_lowercase();
        let mut hits = Vec::new();

        'scan: for partition in partitions {
            for entry in scan_partition(&partition.path)? {
                let entry = entry?;
                if !query.time_range.contains(entry.timestamp) {
                    continue;
                }
                if !needle.is_empty() && !entry.message.to_lowercase().contains(&needle) {
                    continue;
                }
                hits.push(entry);
                if hits.len() >= query.limit {
                    break 'scan;
                }
            }
        }

        Ok(SearchResult {
            total: hits.len() as u64,
            hits,
            took_ms: started.elapsed().as_millis() as i64,
            timed_out: false,
            aggregations: None,
        })
    }

    /// Unlinks partitions that ended before `before` and forgets their
    /// index entries.
    pub fn delete(&self, before: DateTime<Utc>) -> Result<(), StoreError> {
        let removed: Vec<Arc<Partition>> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<String> = inner
                .partitions
                .iter()
                .filter(|(_, p)| p.end <= before)
                .map(|(k, _)| k.clone())
                .collect();
            let removed = keys
                .iter()
                .filter_map(|k| inner.partitions.remove(k))
                .collect();
            inner.stats.partitions = inner.partitions.len();
            removed
        };

        if removed.is_empty() {
            return Ok(());
        }

        let removed_paths: Vec<PathBuf> = removed.iter().map(|p| p.path.clone()).collect();
        for partition in &removed {
            info!(partition = %partition.path.display(), "deleting expired partition");
            if let Err(e) = std::fs::remove_file(&partition.path) {
                warn!(partition = %partition.path.display(), error = %e, "failed to unlink partition");
            }
        }

        self.index
            .lock()
            .unwrap()
            .retain(|_, idx| !removed_paths.contains(&idx.partition));
        Ok(())
    }

    /// Drops all append handles. Subsequent writes reopen partitions.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.partitions.clear();
        inner.stats.partitions = 0;
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().unwrap().stats.clone()
    }

    fn partition_for(
        &self,
        inner: &mut StoreInner,
        timestamp: DateTime<Utc>,
    ) -> Result<Arc<Partition>, StoreError> {
        let interval = self.config.partition_interval.as_secs().max(1) as i64;
        let start_secs = timestamp.timestamp().div_euclid(interval) * interval;
        let start = Utc
            .timestamp_opt(start_secs, 0)
            .single()
            .unwrap_or(timestamp);
        let key = start.format(PARTITION_KEY_FORMAT).to_string();

        if let Some(partition) = inner.partitions.get(&key) {
            return Ok(Arc::clone(partition));
        }

        let path = self
            .config
            .path
            .join(format!("{}{}.{}", PARTITION_PREFIX, key, PARTITION_EXT));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let offset = file.metadata()?.len();

        let partition = Arc::new(Partition {
            path,
            start,
            end: start + chrono::Duration::seconds(interval),
            append: Mutex::new(AppendHandle { file, offset }),
        });
        inner.partitions.insert(key, Arc::clone(&partition));
        inner.stats.partitions = inner.partitions.len();
        Ok(partition)
    }

    /// Reopens existing segments for append and rebuilds the id index by
    /// scanning them once.
    fn load_partitions(&self) -> Result<(), StoreError> {
        let interval = self.config.partition_interval.as_secs().max(1) as i64;
        let mut inner = self.inner.lock().unwrap();
        let mut index = self.index.lock().unwrap();

        for dir_entry in std::fs::read_dir(&self.config.path)? {
            let path = dir_entry?.path();
            let Some(key) = partition_key_from_path(&path) else {
                continue;
            };
            let Some(start) = parse_partition_key(&key) else {
                warn!(path = %path.display(), "skipping segment with unparsable name");
                continue;
            };

            let mut scanned_entries: u64 = 0;
            let mut offset: u64 = 0;
            {
                let mut file = File::open(&path)?;
                loop {
                    let frame_start = offset;
                    match read_frame(&mut file, &path) {
                        Ok(Some(bytes)) => {
                            offset += 4 + bytes.len() as u64;
                            match serde_json::from_slice::<LogEntry>(&bytes) {
                                Ok(entry) => {
                                    scanned_entries += 1;
                                    update_stats(&mut inner.stats, &entry, 4 + bytes.len() as u64);
                                    index.insert(
                                        entry.id.clone(),
                                        IndexEntry {
                                            partition: path.clone(),
                                            offset: frame_start,
                                            timestamp: entry.timestamp,
                                        },
                                    );
                                }
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "skipping undecodable record");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "truncated segment, keeping prefix");
                            break;
                        }
                    }
                }
            }

            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let append_offset = file.metadata()?.len();
            let partition = Arc::new(Partition {
                path: path.clone(),
                start,
                end: start + chrono::Duration::seconds(interval),
                append: Mutex::new(AppendHandle {
                    file,
                    offset: append_offset,
                }),
            });
            inner.partitions.insert(key, partition);
            info!(
                path = %path.display(),
                entries = scanned_entries,
                "reopened partition"
            );
        }

        inner.stats.partitions = inner.partitions.len();
        Ok(())
    }
}

fn update_stats(stats: &mut StoreStats, entry: &LogEntry, bytes: u64) {
    stats.total_entries += 1;
    stats.total_bytes += bytes;
    if stats
        .oldest_entry
        .map(|oldest| entry.timestamp < oldest)
        .unwrap_or(true)
    {
        stats.oldest_entry = Some(entry.timestamp);
    }
    if stats
        .newest_entry
        .map(|newest| entry.timestamp > newest)
        .unwrap_or(true)
    {
        stats.newest_entry = Some(entry.timestamp);
    }
}

fn partition_key_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}", PARTITION_EXT))?;
    stem.strip_prefix(PARTITION_PREFIX).map(|s| s.to_string())
}

fn parse_partition_key(key: &str) -> Option<DateTime<Utc>> {
    let with_minutes = format!("{}:00", key);
    NaiveDateTime::parse_from_str(&with_minutes, "%Y-%m-%d-%H:%M")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn read_frame(file: &mut File, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let mut len_bytes = [0u8; 4];
    match file.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_RECORD_BYTES {
        return Err(StoreError::CorruptFrame(path.to_path_buf(), len));
    }

    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Iterates the decoded entries of one segment file.
fn scan_partition(path: &Path) -> Result<PartitionScan, StoreError> {
    Ok(PartitionScan {
        file: File::open(path)?,
        path: path.to_path_buf(),
        done: false,
    })
}

struct PartitionScan {
    file: File,
    path: PathBuf,
    done: bool,
}

impl Iterator for PartitionScan {
    type Item = Result<LogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_frame(&mut self.file, &self.path) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Some(Ok(entry)),
                Err(e) => {
                    self.done = true;
                    Some(Err(e.into()))
                }
            },
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, TimeRange};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::open(StoreConfig {
            path: dir.path().to_path_buf(),
            partition_interval: Duration::from_secs(24 * 3600),
        })
        .unwrap()
    }

    fn entry(id: &str, ts: DateTime<Utc>, message: &str) -> LogEntry {
        let mut e = LogEntry::new();
        e.id = id.to_string();
        e.timestamp = ts;
        e.message = message.to_string();
        e.raw = format!("raw {}", message);
        e.level = LogLevel::Info;
        e.add_field("k", "v");
        e
    }

    #[test]
    fn test_write_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let written = entry("id-1", ts, "hello");
        store.write(&written).unwrap();

        let read_back = store.get("id-1").unwrap();
        assert_eq!(read_back, written);

        assert!(matches!(store.get("missing"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_partition_file_naming() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        store.write(&entry("id-1", ts, "m")).unwrap();

        assert!(dir.path().join("partition_2024-03-01-00.seg").exists());
    }

    #[test]
    fn test_query_time_range_and_substring() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        for i in 0..10 {
            let message = if i % 2 == 0 { "request OK" } else { "request FAILED" };
            store
                .write(&entry(
                    &format!("id-{}", i),
                    base + chrono::Duration::minutes(i),
                    message,
                ))
                .unwrap();
        }

        let mut query = SearchQuery::new("failed");
        query.time_range = TimeRange::new(base, base + chrono::Duration::hours(1));
        let result = store.query(&query).unwrap();
        assert_eq!(result.total, 5);
        assert!(result.hits.iter().all(|h| h.message.contains("FAILED")));

        // Exclusive end: an entry exactly at the end is not returned.
        let mut query = SearchQuery::new("");
        query.time_range = TimeRange::new(base, base + chrono::Duration::minutes(5));
        let result = store.query(&query).unwrap();
        assert_eq!(result.total, 5);
    }

    #[test]
    fn test_query_respects_limit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        for i in 0..20 {
            store
                .write(&entry(
                    &format!("id-{}", i),
                    base + chrono::Duration::seconds(i),
                    "m",
                ))
                .unwrap();
        }

        let mut query = SearchQuery::new("");
        query.time_range = TimeRange::new(base, base + chrono::Duration::hours(1));
        query.limit = 7;
        assert_eq!(store.query(&query).unwrap().hits.len(), 7);
    }

    #[test]
    fn test_index_rebuilt_on_reopen() {
        let dir = TempDir::new().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let written = entry("persistent", ts, "survives restart");

        {
            let store = store(&dir);
            store.write(&written).unwrap();
            store.close();
        }

        let reopened = store(&dir);
        let read_back = reopened.get("persistent").unwrap();
        assert_eq!(read_back, written);

        let stats = reopened.stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.oldest_entry, Some(ts));
        assert_eq!(stats.newest_entry, Some(ts));
    }

    #[test]
    fn test_append_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        {
            let store = store(&dir);
            store.write(&entry("a", ts, "first")).unwrap();
        }
        {
            let store = store(&dir);
            store.write(&entry("b", ts + chrono::Duration::seconds(1), "second")).unwrap();
            assert_eq!(store.get("a").unwrap().message, "first");
            assert_eq!(store.get("b").unwrap().message, "second");
            assert_eq!(store.stats().total_entries, 2);
        }
    }

    #[test]
    fn test_delete_removes_expired_partitions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        store.write(&entry("old", old, "old")).unwrap();
        store.write(&entry("new", new, "new")).unwrap();
        assert_eq!(store.stats().partitions, 2);

        store.delete(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()).unwrap();

        assert_eq!(store.stats().partitions, 1);
        assert!(matches!(store.get("old"), Err(StoreError::NotFound)));
        assert_eq!(store.get("new").unwrap().id, "new");
        assert!(!dir.path().join("partition_2024-01-01-00.seg").exists());
    }

    #[test]
    fn test_write_batch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let entries: Vec<LogEntry> = (0..5)
            .map(|i| entry(&format!("id-{}", i), ts, "batch"))
            .collect();
        store.write_batch(&entries).unwrap();
        assert_eq!(store.stats().total_entries, 5);
    }
}
