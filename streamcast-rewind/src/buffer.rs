// Rewind buffer: per-stream orchestrator around a ChunkStore.
//
// Two producers may insert concurrently: a live source appending at the
// front of time and a snapshot replay prepending history. Every insert is
// classified on its own by the store, so any interleaving keeps the order
// invariant. Observers are notified synchronously, in registration order,
// after each insert; they must not insert into the buffer from a callback.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, SourceVitals, Timestamp};
use crate::codec::{SnapshotCodec, SnapshotFrame, SnapshotHeader, SnapshotWriter};
use crate::cursor::{CursorShared, DisconnectReason};
use crate::error::{RewindError, RewindResult};
use crate::source::SourceKind;
use crate::stats::{StatsSnapshot, StreamStats};
use crate::store::{ChunkStore, InsertOutcome, Insertion, Position};

pub type ObserverId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    Append(Chunk),
    Prepend(Chunk),
    Evict(Chunk),
    /// Every chunk was discarded (stream reconfigured).
    Reset,
    LoadingStarted,
    LoadingFinished,
}

/// Receives buffer mutations, e.g. an HLS segmenter indexing chunks.
pub trait BufferObserver: Send + Sync {
    fn on_event(&self, event: &BufferEvent);
}

impl<F> BufferObserver for F
where
    F: Fn(&BufferEvent) + Send + Sync,
{
    fn on_event(&self, event: &BufferEvent) {
        self(event);
    }
}

/// Retention configuration, in seconds, converted to chunk counts through
/// the nominal chunk duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewindSettings {
    pub seconds: u32,
    pub burst: u32,
    /// Milliseconds
    pub chunk_duration: u32,
    pub hls: bool,
}

impl RewindSettings {
    /// Chunks needed to cover `seconds`, rounded up.
    #[must_use]
    pub fn chunks_for(&self, seconds: u32) -> usize {
        if self.chunk_duration == 0 {
            return 0;
        }
        let chunks = (u64::from(seconds) * 1000).div_ceil(u64::from(self.chunk_duration));
        usize::try_from(chunks).unwrap_or(usize::MAX)
    }

    /// Whole chunks fitting into `seconds`, used for seeking.
    #[must_use]
    pub fn offset_chunks(&self, seconds: u32) -> i64 {
        if self.chunk_duration == 0 {
            return 0;
        }
        let chunks = u64::from(seconds) * 1000 / u64::from(self.chunk_duration);
        i64::try_from(chunks).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn max_length(&self) -> usize {
        self.chunks_for(self.seconds).max(1)
    }

    #[must_use]
    pub fn burst_chunks(&self) -> usize {
        self.chunks_for(self.burst)
    }
}

/// What the buffer is busy with. Loads and dumps exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Loading,
    Dumping,
}

/// Holds the buffer in `Loading` or `Dumping` until dropped.
#[must_use]
pub struct ActivityGuard<'a> {
    activity: &'a Mutex<Activity>,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        *self.activity.lock() = Activity::Idle;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub records: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub out_of_order: usize,
}

impl LoadSummary {
    fn record(&mut self, outcome: InsertOutcome) {
        self.records += 1;
        match outcome {
            InsertOutcome::Appended | InsertOutcome::Prepended => self.inserted += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
            InsertOutcome::OutOfOrder => self.out_of_order += 1,
        }
    }
}

/// Read-only status for monitoring surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub key: String,
    pub stream_key: Option<String>,
    pub source: Option<String>,
    pub chunks: usize,
    pub max_chunks: Option<usize>,
    pub buffered_seconds: f64,
    pub buffered_bytes: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub settings: RewindSettings,
    pub activity: Activity,
    pub listeners: usize,
    pub stats: StatsSnapshot,
}

pub(crate) struct BufferState {
    pub(crate) store: ChunkStore,
    pub(crate) settings: RewindSettings,
    stream_key: Option<String>,
    frames_per_second: Option<f64>,
    vitals_received: bool,
    pub(crate) source: Option<SourceKind>,
}

pub struct RewindBuffer {
    pub(crate) key: String,
    pub(crate) state: RwLock<BufferState>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn BufferObserver>)>>,
    next_observer: AtomicU64,
    // Serializes mutation + notification so observers see events in store order
    dispatch: Mutex<()>,
    activity: Mutex<Activity>,
    pub(crate) cursors: DashMap<u64, Arc<CursorShared>>,
    pub(crate) next_cursor: AtomicU64,
    pub(crate) stats: StreamStats,
    // Generation of the attached source alongside its task
    pub(crate) source_task: Mutex<Option<(u64, JoinHandle<()>)>>,
    pub(crate) next_source: AtomicU64,
}

impl RewindBuffer {
    #[must_use]
    pub fn new(key: impl Into<String>, settings: RewindSettings) -> Arc<Self> {
        let store = ChunkStore::new(Some(settings.max_length()));
        Arc::new(Self {
            key: key.into(),
            state: RwLock::new(BufferState {
                store,
                settings,
                stream_key: None,
                frames_per_second: None,
                vitals_received: false,
                source: None,
            }),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            dispatch: Mutex::new(()),
            activity: Mutex::new(Activity::Idle),
            cursors: DashMap::new(),
            next_cursor: AtomicU64::new(1),
            stats: StreamStats::new(),
            source_task: Mutex::new(None),
            next_source: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn settings(&self) -> RewindSettings {
        self.state.read().settings.clone()
    }

    #[must_use]
    pub fn stream_key(&self) -> Option<String> {
        self.state.read().stream_key.clone()
    }

    #[must_use]
    pub fn frames_per_second(&self) -> Option<f64> {
        self.state.read().frames_per_second
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().store.is_empty()
    }

    #[must_use]
    pub fn buffered_duration(&self) -> Duration {
        Duration::from_millis(self.state.read().store.duration_ms())
    }

    #[must_use]
    pub const fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn subscribe(&self, observer: Arc<dyn BufferObserver>) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    fn notify(&self, events: &[BufferEvent]) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn BufferObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for event in events {
            for observer in &observers {
                observer.on_event(event);
            }
        }
    }

    fn emit(&self, event: BufferEvent) {
        let _dispatch = self.dispatch.lock();
        self.notify(&[event]);
    }

    pub fn insert(&self, chunk: Chunk) -> InsertOutcome {
        let _dispatch = self.dispatch.lock();
        let ts = chunk.ts;
        let Insertion { outcome, evicted } = self.state.write().store.insert(chunk.clone());
        self.stats.record_insert(outcome, evicted.len());

        let mut events = Vec::with_capacity(1 + evicted.len());
        match outcome {
            InsertOutcome::Appended => events.push(BufferEvent::Append(chunk)),
            InsertOutcome::Prepended => events.push(BufferEvent::Prepend(chunk)),
            InsertOutcome::Duplicate => {
                debug!(stream = %self.key, ts, "Dropping duplicate chunk");
            }
            InsertOutcome::OutOfOrder => {
                warn!(
                    stream = %self.key,
                    ts,
                    "Dropping chunk inside buffered range, mid-sequence insert is unsupported"
                );
            }
        }
        events.extend(evicted.into_iter().map(BufferEvent::Evict));
        self.notify(&events);
        outcome
    }

    /// Reconfigure retention. Chunks beyond the new bound are evicted by the next insert.
    pub fn set_rewind(&self, seconds: u32, burst: u32) {
        let mut state = self.state.write();
        state.settings.seconds = seconds;
        state.settings.burst = burst;
        let max_length = state.settings.max_length();
        state.store.set_max_length(Some(max_length));
        info!(stream = %self.key, seconds, burst, max_length, "Rewind reconfigured");
    }

    /// Apply a producer's vitals. A new stream key on a populated buffer resets it.
    pub fn apply_vitals(&self, vitals: SourceVitals) {
        let _dispatch = self.dispatch.lock();
        let reset = {
            let mut state = self.state.write();
            let key_changed = state
                .stream_key
                .as_deref()
                .is_some_and(|key| key != vitals.stream_key);
            let reset = key_changed && !state.store.is_empty();
            if reset {
                let dropped = state.store.clear();
                warn!(
                    stream = %self.key,
                    old = ?state.stream_key,
                    new = %vitals.stream_key,
                    dropped,
                    "Stream key changed, resetting buffer"
                );
            }

            if vitals.chunk_duration > 0 {
                state.settings.chunk_duration = vitals.chunk_duration;
            }
            let max_length = state.settings.max_length();
            state.store.set_max_length(Some(max_length));
            state.stream_key = Some(vitals.stream_key);
            state.frames_per_second = Some(vitals.frames_per_second);
            state.vitals_received = true;
            debug!(stream = %self.key, max_length, "Vitals applied");
            reset
        };
        if reset {
            self.notify(&[BufferEvent::Reset]);
        }
    }

    /// Discard every chunk.
    pub fn reset(&self) {
        let _dispatch = self.dispatch.lock();
        let dropped = self.state.write().store.clear();
        info!(stream = %self.key, dropped, "Buffer reset");
        self.notify(&[BufferEvent::Reset]);
    }

    #[must_use]
    pub fn at(&self, position: Position) -> Option<Chunk> {
        self.state.read().store.at(position).cloned()
    }

    #[must_use]
    pub fn range(&self, position: Position, count: usize) -> Vec<Chunk> {
        self.state.read().store.range(position, count)
    }

    pub fn find(&self, ts: Timestamp) -> RewindResult<Chunk> {
        self.state.read().store.find(ts).cloned()
    }

    #[must_use]
    pub fn first(&self) -> Option<Chunk> {
        self.state.read().store.first().cloned()
    }

    #[must_use]
    pub fn last(&self) -> Option<Chunk> {
        self.state.read().store.last().cloned()
    }

    /// Oldest chunk at or after `from`, or the live edge when `from` is unset.
    /// Next chunk for a live reader; `Unbounded` means it has no position yet.
    pub(crate) fn next_after(&self, from: Bound<Timestamp>) -> Option<Chunk> {
        let state = self.state.read();
        match from {
            Bound::Included(ts) => state.store.first_at_or_after(ts).cloned(),
            Bound::Excluded(ts) => state.store.first_after(ts).cloned(),
            Bound::Unbounded => state.store.last().cloned(),
        }
    }

    #[must_use]
    pub fn activity(&self) -> Activity {
        *self.activity.lock()
    }

    fn begin(&self, next: Activity) -> RewindResult<ActivityGuard<'_>> {
        let mut activity = self.activity.lock();
        match *activity {
            Activity::Idle => {
                *activity = next;
                Ok(ActivityGuard {
                    activity: &self.activity,
                })
            }
            Activity::Loading => Err(RewindError::AlreadyLoading(self.key.clone())),
            Activity::Dumping => Err(RewindError::AlreadyDumping(self.key.clone())),
        }
    }

    /// Mark the buffer as loading. Fails while a load or dump is in progress.
    pub fn begin_load(&self) -> RewindResult<ActivityGuard<'_>> {
        self.begin(Activity::Loading)
    }

    /// Mark the buffer as dumping. Fails while a load or dump is in progress.
    pub fn begin_dump(&self) -> RewindResult<ActivityGuard<'_>> {
        self.begin(Activity::Dumping)
    }

    /// Replay a snapshot stream into the buffer.
    ///
    /// Records arrive newest first, so against a live buffer they prepend.
    /// `LoadingStarted` and `LoadingFinished` bracket the replay even when
    /// it fails part way.
    pub async fn load_buffer<R>(&self, reader: R) -> RewindResult<LoadSummary>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.begin_load()?;
        info!(stream = %self.key, "Loading buffer");
        self.emit(BufferEvent::LoadingStarted);

        let result = self.replay(reader).await;

        self.emit(BufferEvent::LoadingFinished);
        match &result {
            Ok(summary) => {
                self.stats.record_load();
                info!(
                    stream = %self.key,
                    records = summary.records,
                    inserted = summary.inserted,
                    duplicates = summary.duplicates,
                    chunks = self.len(),
                    "Buffer loaded"
                );
            }
            Err(e) => warn!(stream = %self.key, "Buffer load failed: {}", e),
        }
        result
    }

    async fn replay<R>(&self, reader: R) -> RewindResult<LoadSummary>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, SnapshotCodec::new());
        let mut summary = LoadSummary::default();
        while let Some(frame) = frames.next().await {
            match frame? {
                SnapshotFrame::Header(header) => self.apply_snapshot_header(&header)?,
                SnapshotFrame::Chunk(chunk) => summary.record(self.insert(chunk)),
            }
        }
        Ok(summary)
    }

    fn apply_snapshot_header(&self, header: &SnapshotHeader) -> RewindResult<()> {
        let mut state = self.state.write();
        if let (Some(expected), Some(found)) = (&state.stream_key, &header.stream_key) {
            if expected != found {
                return Err(RewindError::StreamKeyMismatch {
                    expected: expected.clone(),
                    found: found.clone(),
                });
            }
        }
        if state.stream_key.is_none() {
            state.stream_key.clone_from(&header.stream_key);
        }
        // Producer vitals win over whatever the snapshot was recorded with
        if !state.vitals_received && header.chunk_duration > 0 {
            state.settings.chunk_duration = header.chunk_duration;
            let max_length = state.settings.max_length();
            state.store.set_max_length(Some(max_length));
        }
        debug!(
            stream = %self.key,
            start_ts = header.start_ts,
            end_ts = header.end_ts,
            chunk_duration = header.chunk_duration,
            "Snapshot header received"
        );
        Ok(())
    }

    /// Snapshot writer over a consistent copy of the current chunks.
    #[must_use]
    pub fn dump_buffer(&self) -> SnapshotWriter {
        let state = self.state.read();
        let header = SnapshotHeader {
            start_ts: state.store.first().map_or(0, |c| c.ts),
            end_ts: state.store.last().map_or(0, |c| c.ts),
            chunk_duration: state.settings.chunk_duration,
            stream_key: state.stream_key.clone(),
            hls: state.settings.hls,
        };
        SnapshotWriter::new(header, state.store.iter().cloned().collect())
    }

    #[must_use]
    pub fn status(&self) -> BufferStatus {
        let state = self.state.read();
        let store = &state.store;
        BufferStatus {
            key: self.key.clone(),
            stream_key: state.stream_key.clone(),
            source: state.source.as_ref().map(ToString::to_string),
            chunks: store.len(),
            max_chunks: store.max_length(),
            buffered_seconds: store.duration_ms() as f64 / 1000.0,
            buffered_bytes: store.bytes(),
            oldest: store.first().and_then(|c| DateTime::from_timestamp_millis(c.ts)),
            newest: store.last().and_then(|c| DateTime::from_timestamp_millis(c.ts)),
            settings: state.settings.clone(),
            activity: self.activity(),
            listeners: self.cursors.len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Tear down: stop the source, disconnect every listener, drop observers.
    pub fn close(&self) {
        if let Some((_, task)) = self.source_task.lock().take() {
            task.abort();
        }
        let disconnected = self.disconnect_all(DisconnectReason::BufferClosed);
        self.observers.write().clear();
        info!(stream = %self.key, disconnected, "Buffer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn settings(seconds: u32) -> RewindSettings {
        RewindSettings {
            seconds,
            burst: 2,
            chunk_duration: 1000,
            hls: false,
        }
    }

    fn chunk(ts: Timestamp) -> Chunk {
        Chunk::new(ts, 1000, Bytes::from(vec![0u8; 10]))
    }

    fn recorder(buffer: &RewindBuffer) -> Arc<Mutex<Vec<BufferEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        buffer.subscribe(Arc::new(move |event: &BufferEvent| {
            sink.lock().push(event.clone());
        }));
        events
    }

    #[test]
    fn test_settings_conversion() {
        let s = RewindSettings {
            seconds: 10,
            burst: 3,
            chunk_duration: 300,
            hls: false,
        };
        assert_eq!(s.max_length(), 34);
        assert_eq!(s.burst_chunks(), 10);
        assert_eq!(s.offset_chunks(1), 3);
    }

    #[test]
    fn test_insert_notifies_append_then_evictions() {
        let buffer = RewindBuffer::new("test", settings(2));
        let events = recorder(&buffer);

        for ts in [1000, 2000, 3000] {
            buffer.insert(chunk(ts));
        }

        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], BufferEvent::Append(chunk(3000)));
        assert_eq!(events[3], BufferEvent::Evict(chunk(1000)));
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let buffer = RewindBuffer::new("test", settings(60));
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            buffer.subscribe(Arc::new(move |_: &BufferEvent| order.lock().push(n)));
        }
        buffer.insert(chunk(1000));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let buffer = RewindBuffer::new("test", settings(60));
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = buffer.subscribe(Arc::new(move |_: &BufferEvent| *sink.lock() += 1));

        buffer.insert(chunk(1000));
        assert!(buffer.unsubscribe(id));
        assert!(!buffer.unsubscribe(id));
        buffer.insert(chunk(2000));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_set_rewind_defers_eviction() {
        let buffer = RewindBuffer::new("test", settings(10));
        for i in 1..=6 {
            buffer.insert(chunk(i * 1000));
        }
        buffer.set_rewind(3, 1);
        assert_eq!(buffer.len(), 6);

        buffer.insert(chunk(7000));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.first().unwrap().ts, 5000);
    }

    #[test]
    fn test_vitals_key_change_resets() {
        let buffer = RewindBuffer::new("test", settings(60));
        let events = recorder(&buffer);
        let vitals = |key: &str| SourceVitals {
            stream_key: key.to_string(),
            frames_per_second: 38.28,
            chunk_duration: 500,
        };

        buffer.apply_vitals(vitals("mp3-128"));
        buffer.insert(chunk(1000));
        buffer.apply_vitals(vitals("mp3-128"));
        assert_eq!(buffer.len(), 1);

        buffer.apply_vitals(vitals("aac-64"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stream_key().as_deref(), Some("aac-64"));
        assert_eq!(buffer.settings().chunk_duration, 500);
        assert_eq!(events.lock().last(), Some(&BufferEvent::Reset));
    }

    #[test]
    fn test_load_and_dump_exclude_each_other() {
        let buffer = RewindBuffer::new("test", settings(60));
        let guard = buffer.begin_dump().unwrap();
        assert!(matches!(buffer.begin_load(), Err(RewindError::AlreadyDumping(_))));
        assert!(matches!(buffer.begin_dump(), Err(RewindError::AlreadyDumping(_))));
        drop(guard);

        let guard = buffer.begin_load().unwrap();
        assert_eq!(buffer.activity(), Activity::Loading);
        assert!(matches!(buffer.begin_dump(), Err(RewindError::AlreadyLoading(_))));
        drop(guard);
        assert_eq!(buffer.activity(), Activity::Idle);
    }

    #[tokio::test]
    async fn test_load_brackets_with_loading_events() {
        let source = RewindBuffer::new("test", settings(60));
        for ts in [1000, 2000, 3000] {
            source.insert(chunk(ts));
        }
        let snapshot = source.dump_buffer().into_reader();

        let target = RewindBuffer::new("test", settings(60));
        let events = recorder(&target);
        let summary = target.load_buffer(snapshot).await.unwrap();
        assert_eq!(summary.inserted, 3);

        let events = events.lock();
        assert_eq!(events.first(), Some(&BufferEvent::LoadingStarted));
        assert_eq!(events.last(), Some(&BufferEvent::LoadingFinished));
        // first record lands in an empty store (append), the rest prepend
        assert_eq!(events[1], BufferEvent::Append(chunk(3000)));
        assert_eq!(events[2], BufferEvent::Prepend(chunk(2000)));
        assert_eq!(events[3], BufferEvent::Prepend(chunk(1000)));
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_stream_key() {
        let source = RewindBuffer::new("test", settings(60));
        source.apply_vitals(SourceVitals {
            stream_key: "aac-64".to_string(),
            frames_per_second: 21.5,
            chunk_duration: 1000,
        });
        source.insert(chunk(1000));

        let target = RewindBuffer::new("test", settings(60));
        target.apply_vitals(SourceVitals {
            stream_key: "mp3-128".to_string(),
            frames_per_second: 38.28,
            chunk_duration: 1000,
        });
        let err = target
            .load_buffer(source.dump_buffer().into_reader())
            .await
            .unwrap_err();
        assert!(matches!(err, RewindError::StreamKeyMismatch { .. }));
        assert!(target.is_empty());
        assert_eq!(target.activity(), Activity::Idle);
    }

    #[test]
    fn test_status_reports_store_shape() {
        let buffer = RewindBuffer::new("jazz", settings(60));
        buffer.insert(chunk(1_700_000_000_000));
        buffer.insert(chunk(1_700_000_001_000));

        let status = buffer.status();
        assert_eq!(status.key, "jazz");
        assert_eq!(status.chunks, 2);
        assert_eq!(status.max_chunks, Some(60));
        assert!((status.buffered_seconds - 2.0).abs() < f64::EPSILON);
        assert_eq!(status.buffered_bytes, 20);
        assert_eq!(
            status.newest.unwrap().timestamp_millis(),
            1_700_000_001_000
        );
        assert_eq!(status.stats.chunks_appended, 2);
        assert!(serde_json::to_string(&status).is_ok());
    }
}
