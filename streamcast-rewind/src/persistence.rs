// Disk persistence for rewind buffers
//
// One dump file per stream: `<dir>/<sanitized key>.dump`, written through a
// temp file and renamed into place. All streams share a single FIFO dump
// queue drained by one worker at a time, bounding disk I/O.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{LoadSummary, RewindBuffer};
use crate::codec::{SnapshotWriter, WriteSummary};
use crate::error::RewindResult;

const DUMP_EXTENSION: &str = "dump";

/// Dump file location for `key` under `dir`.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`. When that changes the key,
/// a short sha256 suffix keeps distinct keys on distinct files.
#[must_use]
pub fn dump_path(dir: &Path, key: &str) -> PathBuf {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if sanitized == key {
        sanitized
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("{sanitized}-{}", hex::encode(&digest[..4]))
    };
    dir.join(format!("{name}.{DUMP_EXTENSION}"))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No dump file on disk; the stream starts empty.
    NoDump,
    Loaded(LoadSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    Written(WriteSummary),
    /// The buffer was empty; any previous dump file was deleted.
    Removed,
}

/// Loads and dumps one buffer to its file.
pub struct Dumper {
    buffer: Arc<RewindBuffer>,
    path: PathBuf,
}

impl Dumper {
    #[must_use]
    pub fn new(buffer: Arc<RewindBuffer>, dir: &Path) -> Self {
        let path = dump_path(dir, buffer.key());
        Self { buffer, path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn buffer(&self) -> &Arc<RewindBuffer> {
        &self.buffer
    }

    /// Restore the buffer from its dump file. A missing file is not an error.
    pub async fn try_load(&self) -> RewindResult<LoadOutcome> {
        let file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(stream = %self.buffer.key(), path = ?self.path, "No dump file");
                return Ok(LoadOutcome::NoDump);
            }
            Err(e) => return Err(e.into()),
        };
        let summary = self.buffer.load_buffer(BufReader::new(file)).await?;
        Ok(LoadOutcome::Loaded(summary))
    }

    /// Write the buffer to disk, replacing the previous dump atomically.
    ///
    /// Fails without touching disk while the buffer is loading or already dumping.
    pub async fn dump(&self) -> RewindResult<DumpOutcome> {
        let _guard = self.buffer.begin_dump()?;
        let snapshot = self.buffer.dump_buffer();

        if snapshot.is_empty() {
            return self.remove_dump().await;
        }

        let tmp = temp_path(&self.path);
        let summary = match self.write_temp(&tmp, snapshot).await {
            Ok(summary) if summary.records == 0 => {
                fs::remove_file(&tmp).await?;
                warn!(stream = %self.buffer.key(), skipped = summary.skipped, "No chunk could be encoded");
                return self.remove_dump().await;
            }
            Ok(summary) => summary,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.buffer.stats().record_dump();
        info!(
            stream = %self.buffer.key(),
            records = summary.records,
            skipped = summary.skipped,
            bytes = summary.bytes,
            "Buffer dumped"
        );
        Ok(DumpOutcome::Written(summary))
    }

    async fn remove_dump(&self) -> RewindResult<DumpOutcome> {
        match fs::remove_file(&self.path).await {
            Ok(()) => info!(stream = %self.buffer.key(), path = ?self.path, "Removed dump of empty buffer"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(DumpOutcome::Removed)
    }

    async fn write_temp(&self, tmp: &Path, snapshot: SnapshotWriter) -> RewindResult<WriteSummary> {
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut writer = BufWriter::new(fs::File::create(tmp).await?);
        let summary = snapshot.write_to(&mut writer).await?;
        writer.into_inner().sync_all().await?;
        Ok(summary)
    }
}

/// Clears the shared dumping flag when the drain ends, even if cancelled.
struct DumpingFlag<'a>(&'a AtomicBool);

impl Drop for DumpingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Schedules dumps for every registered stream.
pub struct PersistenceManager {
    dir: PathBuf,
    dumpers: DashMap<String, Arc<Dumper>>,
    queue: Mutex<VecDeque<String>>,
    dumping: AtomicBool,
}

impl PersistenceManager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dumpers: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            dumping: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn register(&self, buffer: Arc<RewindBuffer>) -> Arc<Dumper> {
        let key = buffer.key().to_string();
        let dumper = Arc::new(Dumper::new(buffer, &self.dir));
        self.dumpers.insert(key, Arc::clone(&dumper));
        dumper
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.queue.lock().retain(|queued| queued != key);
        self.dumpers.remove(key).is_some()
    }

    #[must_use]
    pub fn dumper(&self, key: &str) -> Option<Arc<Dumper>> {
        self.dumpers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn is_dumping(&self) -> bool {
        self.dumping.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Restore every registered stream. Failures are logged and the stream starts empty.
    pub async fn load_all(&self) -> usize {
        let dumpers: Vec<Arc<Dumper>> = self.dumpers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut restored = 0;
        for dumper in dumpers {
            match dumper.try_load().await {
                Ok(LoadOutcome::Loaded(_)) => restored += 1,
                Ok(LoadOutcome::NoDump) => {}
                Err(e) => error!(
                    stream = %dumper.buffer().key(),
                    "Failed to restore buffer, starting empty: {}", e
                ),
            }
        }
        info!(streams = self.dumpers.len(), restored, "Buffers restored from disk");
        restored
    }

    /// Queue a dump for `key`. Returns false if it is already queued or unknown.
    pub fn request_dump(&self, key: &str) -> bool {
        if !self.dumpers.contains_key(key) {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.iter().any(|queued| queued == key) {
            return false;
        }
        queue.push_back(key.to_string());
        true
    }

    pub fn request_all(&self) -> usize {
        let keys: Vec<String> = self.dumpers.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.request_dump(key)).count()
    }

    /// Drain the queue one dump at a time. Returns immediately if another
    /// drain is in progress; its worker picks up anything queued meanwhile.
    pub async fn process_queue(&self) -> usize {
        let mut completed = 0;
        loop {
            if self
                .dumping
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Dump queue already being processed");
                return completed;
            }
            {
                let _flag = DumpingFlag(&self.dumping);
                completed += self.drain().await;
            }
            // A request may land between the last pop and the flag clearing
            if self.queue.lock().is_empty() {
                return completed;
            }
        }
    }

    async fn drain(&self) -> usize {
        let mut completed = 0;
        loop {
            let Some(key) = self.queue.lock().pop_front() else {
                return completed;
            };
            let Some(dumper) = self.dumper(&key) else {
                continue;
            };
            match dumper.dump().await {
                Ok(_) => completed += 1,
                Err(e) => error!(stream = %key, "Dump failed: {}", e),
            }
        }
    }

    /// Dump every stream now, e.g. on orderly shutdown.
    pub async fn dump_all(&self) -> usize {
        self.request_all();
        let completed = self.process_queue().await;
        info!(completed, "Dumped all buffers");
        completed
    }

    /// Dump every stream each `interval` until `token` is cancelled.
    pub async fn run(&self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?interval, dir = ?self.dir, "Periodic dumps enabled");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.request_all();
                    self.process_queue().await;
                }
                () = token.cancelled() => break,
            }
        }
        debug!("Periodic dumps stopped");
    }
}
