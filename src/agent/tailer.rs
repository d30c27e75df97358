use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),
}

/// Tailer configuration.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Read buffer size in bytes.
    pub buffer_size: usize,
    /// Where the per-file offset map is persisted.
    pub state_file: PathBuf,
    /// How often an idle file is re-polled.
    pub poll_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            state_file: PathBuf::from("/var/lib/logpipe/tailer-state.json"),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Persisted read position and identity of one tracked file.
///
/// A file on restart is the same stream iff (device, inode) match the
/// stored identity; anything else is treated as a rotation and read
/// from offset 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub path: PathBuf,
    pub offset: u64,
    pub inode: u64,
    pub device: u64,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    device: u64,
    inode: u64,
}

fn file_identity(metadata: &std::fs::Metadata) -> FileIdentity {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileIdentity {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }
    #[cfg(not(unix))]
    {
        // No stable identity off unix; hash size and mtime as a proxy.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        metadata.len().hash(&mut hasher);
        if let Ok(modified) = metadata.modified() {
            modified.hash(&mut hasher);
        }
        FileIdentity {
            device: 0,
            inode: hasher.finish(),
        }
    }
}

/// Follows a set of append-only text files, emitting each complete line
/// exactly once across rotations and restarts.
pub struct FileTailer {
    config: TailerConfig,
    states: Mutex<HashMap<PathBuf, FileState>>,
    readers: Mutex<HashMap<PathBuf, ReaderHandle>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    event_rx: Mutex<Option<mpsc::Receiver<notify::Event>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    output: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    lines_emitted: AtomicU64,
    lines_dropped: AtomicU64,
}

struct ReaderHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FileTailer {
    /// Creates a tailer, loading any previously persisted file states.
    pub fn new(config: TailerConfig, output: mpsc::Sender<String>) -> Result<Arc<Self>, TailerError> {
        let (shutdown_tx, _) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel::<notify::Event>(1024);

        let watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                // Events are advisory only; the reader's stat check is the
                // authoritative rotation detector, so dropping on a full
                // channel is safe.
                Ok(event) => {
                    let _ = event_tx.try_send(event);
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })?;

        let tailer = Arc::new(Self {
            config,
            states: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(Some(watcher)),
            event_rx: Mutex::new(Some(event_rx)),
            watch_task: Mutex::new(None),
            output,
            shutdown_tx,
            lines_emitted: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
        });

        if let Err(e) = tailer.load_state() {
            warn!(error = %e, "failed to load tailer state, starting fresh");
        }

        Ok(tailer)
    }

    /// Begins watching for filesystem events. Files are added with
    /// [`add_file`](Self::add_file) before or after starting.
    pub fn start(self: &Arc<Self>) {
        let event_rx = self.event_rx.lock().unwrap().take();
        let Some(mut event_rx) = event_rx else {
            return;
        };

        let tailer = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => tailer.handle_event(event).await,
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.watch_task.lock().unwrap() = Some(task);
    }

    /// Stops all readers, waits for them to drain and persists state.
    pub async fn stop(self: &Arc<Self>) -> Result<(), TailerError> {
        let _ = self.shutdown_tx.send(true);

        let readers: Vec<ReaderHandle> = {
            let mut guard = self.readers.lock().unwrap();
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in readers {
            let _ = handle.stop_tx.send(true);
            let _ = handle.task.await;
        }

        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
        }
        *self.watcher.lock().unwrap() = None;

        self.save_state()
    }

    /// Registers a file and starts its reader. Resolves symlinks and
    /// resumes from the persisted offset when the on-disk identity still
    /// matches.
    pub fn add_file(self: &Arc<Self>, path: &Path) -> Result<(), TailerError> {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        {
            let readers = self.readers.lock().unwrap();
            if readers.contains_key(&resolved) {
                return Ok(());
            }
        }

        let metadata = std::fs::metadata(&resolved)?;
        let identity = file_identity(&metadata);

        {
            let mut states = self.states.lock().unwrap();
            match states.get_mut(&resolved) {
                Some(state) if state.device == identity.device && state.inode == identity.inode => {
                    // Same stream as last time; keep the stored offset.
                }
                Some(state) => {
                    debug!(path = %resolved.display(), "stored identity differs, treating as rotated");
                    state.offset = 0;
                    state.device = identity.device;
                    state.inode = identity.inode;
                }
                None => {
                    states.insert(
                        resolved.clone(),
                        FileState {
                            path: resolved.clone(),
                            offset: 0,
                            inode: identity.inode,
                            device: identity.device,
                            size: metadata.len(),
                            mod_time: metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
                        },
                    );
                }
            }
        }

        if let Some(watcher) = self.watcher.lock().unwrap().as_mut() {
            if let Err(e) = watcher.watch(&resolved, RecursiveMode::NonRecursive) {
                warn!(path = %resolved.display(), error = %e, "failed to watch file");
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let tailer = Arc::clone(self);
        let reader_path = resolved.clone();
        let task = tokio::spawn(async move {
            tailer.tail_file(reader_path, stop_rx).await;
        });

        self.readers
            .lock()
            .unwrap()
            .insert(resolved, ReaderHandle { stop_tx, task });

        Ok(())
    }

    /// Stops tailing a file and drops its state.
    pub async fn remove_file(self: &Arc<Self>, path: &Path) -> Result<(), TailerError> {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let handle = self.readers.lock().unwrap().remove(&resolved);
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let _ = handle.task.await;
        }

        self.states.lock().unwrap().remove(&resolved);

        if let Some(watcher) = self.watcher.lock().unwrap().as_mut() {
            let _ = watcher.unwatch(&resolved);
        }

        Ok(())
    }

    pub fn lines_emitted(&self) -> u64 {
        self.lines_emitted.load(Ordering::Relaxed)
    }

    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of the tracked file states.
    pub fn states(&self) -> HashMap<PathBuf, FileState> {
        self.states.lock().unwrap().clone()
    }

    async fn handle_event(self: &Arc<Self>, event: notify::Event) {
        use notify::event::{EventKind, ModifyKind};

        match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    self.handle_rotation(&path).await;
                }
            }
            EventKind::Create(_) => {
                for path in event.paths {
                    if self.states.lock().unwrap().contains_key(&path) {
                        if let Err(e) = self.add_file(&path) {
                            warn!(path = %path.display(), error = %e, "failed to re-add created file");
                        }
                    }
                }
            }
            // Writes are picked up by the readers themselves.
            _ => {}
        }
    }

    async fn handle_rotation(self: &Arc<Self>, path: &Path) {
        info!(path = %path.display(), "rotation event, reopening from start");

        let handle = self.readers.lock().unwrap().remove(path);
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let _ = handle.task.await;
        }

        if let Some(state) = self.states.lock().unwrap().get_mut(path) {
            state.offset = 0;
        }

        // The replacement file may not exist yet right after the rename.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Err(e) = self.add_file(path) {
            warn!(path = %path.display(), error = %e, "failed to re-add rotated file");
        }
    }

    /// Per-file reader loop.
    async fn tail_file(self: Arc<Self>, path: PathBuf, mut stop_rx: watch::Receiver<bool>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        'reopen: loop {
            if *stop_rx.borrow() || *shutdown_rx.borrow() {
                return;
            }

            let (mut reader, identity) = match self.open_at_offset(&path) {
                Ok(opened) => opened,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to open file, reader exiting");
                    return;
                }
            };

            let mut eof_count: u32 = 0;
            loop {
                if *stop_rx.borrow() || *shutdown_rx.borrow() {
                    return;
                }

                let mut line = String::new();
                let bytes_read = match reader.read_line(&mut line) {
                    Ok(n) => n,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "read error, reader exiting");
                        return;
                    }
                };

                if bytes_read == 0 {
                    // EOF: check whether the file was rotated or truncated
                    // behind our back, then idle.
                    match self.check_identity(&path, identity) {
                        IdentityCheck::Rotated => {
                            info!(path = %path.display(), "identity changed on disk, reopening from start");
                            self.reset_offset(&path);
                            continue 'reopen;
                        }
                        IdentityCheck::Truncated => {
                            info!(path = %path.display(), "file truncated, reopening from start");
                            self.reset_offset(&path);
                            continue 'reopen;
                        }
                        IdentityCheck::Missing | IdentityCheck::Unchanged => {}
                    }

                    eof_count += 1;
                    let sleep_for = if eof_count <= 3 {
                        self.config.poll_interval / 10
                    } else {
                        self.config.poll_interval
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = stop_rx.changed() => return,
                        _ = shutdown_rx.changed() => return,
                    }
                    continue;
                }

                eof_count = 0;

                // Partial trailing line without a terminator: rewind so it
                // is re-read whole once the writer finishes it.
                if !line.ends_with('\n') {
                    let _ = reader.seek(SeekFrom::Current(-(bytes_read as i64)));
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval / 10) => {}
                        _ = stop_rx.changed() => return,
                        _ = shutdown_rx.changed() => return,
                    }
                    continue;
                }

                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                self.emit_line(trimmed, &mut stop_rx, &mut shutdown_rx).await;
                self.advance_offset(&path, bytes_read as u64);
            }
        }
    }

    fn open_at_offset(&self, path: &Path) -> Result<(BufReader<File>, FileIdentity), TailerError> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let identity = file_identity(&metadata);

        let offset = {
            let mut states = self.states.lock().unwrap();
            match states.get_mut(path) {
                // An offset past the end means the file shrank; start over.
                Some(state) if state.offset > metadata.len() => {
                    state.offset = 0;
                    0
                }
                Some(state) => state.offset,
                None => 0,
            }
        };

        let mut reader = BufReader::with_capacity(self.config.buffer_size, file);
        reader.seek(SeekFrom::Start(offset))?;
        Ok((reader, identity))
    }

    fn check_identity(&self, path: &Path, opened: FileIdentity) -> IdentityCheck {
        match std::fs::metadata(path) {
            Ok(metadata) => {
                if file_identity(&metadata) != opened {
                    return IdentityCheck::Rotated;
                }
                let offset = {
                    let states = self.states.lock().unwrap();
                    states.get(path).map(|s| s.offset).unwrap_or(0)
                };
                if metadata.len() < offset {
                    IdentityCheck::Truncated
                } else {
                    IdentityCheck::Unchanged
                }
            }
            Err(_) => IdentityCheck::Missing,
        }
    }

    fn reset_offset(&self, path: &Path) {
        if let Some(state) = self.states.lock().unwrap().get_mut(path) {
            state.offset = 0;
        }
    }

    fn advance_offset(&self, path: &Path, bytes: u64) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(path) {
            state.offset += bytes;
            state.mod_time = Utc::now();
            if state.offset > state.size {
                state.size = state.offset;
            }
        }
    }

    async fn emit_line(
        &self,
        line: String,
        stop_rx: &mut watch::Receiver<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        match self.output.try_send(line) {
            Ok(()) => {
                self.lines_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(line)) => {
                // Bounded second attempt; a stalled consumer must not
                // freeze the reader forever.
                tokio::select! {
                    sent = tokio::time::timeout(Duration::from_secs(5), self.output.send(line)) => {
                        match sent {
                            Ok(Ok(())) => {
                                self.lines_emitted.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {
                                self.lines_dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("output channel blocked, dropping line");
                            }
                        }
                    }
                    _ = stop_rx.changed() => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.lines_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn load_state(&self) -> Result<(), TailerError> {
        let data = match std::fs::read(&self.config.state_file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let states: HashMap<PathBuf, FileState> = serde_json::from_slice(&data)?;
        info!(files = states.len(), "loaded tailer state");
        *self.states.lock().unwrap() = states;
        Ok(())
    }

    fn save_state(&self) -> Result<(), TailerError> {
        let states = self.states.lock().unwrap().clone();
        let data = serde_json::to_vec_pretty(&states)?;

        if let Some(dir) = self.config.state_file.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // Write-then-rename keeps the state file whole even if we die
        // mid-write.
        let tmp = self.config.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.config.state_file)?;
        debug!(files = states.len(), "saved tailer state");
        Ok(())
    }
}

enum IdentityCheck {
    Unchanged,
    Rotated,
    Truncated,
    Missing,
}
