use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferEvent, ObserverId, RewindBuffer};
use crate::chunk::{Chunk, Timestamp};
use crate::store::Position;

/// Why a listener stopped receiving chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Client,
    SlowConsumer,
    BufferClosed,
    PumpComplete,
}

/// Where a cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOffset {
    /// Seconds behind the live edge.
    Seconds(u32),
    /// Nearest chunk to an absolute time.
    Timestamp(Timestamp),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorMode {
    /// Follow the live edge indefinitely.
    #[default]
    Live,
    /// Deliver a fixed window and finish. `None` uses the buffer's burst.
    Pump { seconds: Option<u32> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    pub offset: Option<CursorOffset>,
    pub mode: CursorMode,
}

impl CursorOptions {
    #[must_use]
    pub fn live() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pump(seconds: Option<u32>) -> Self {
        Self {
            offset: None,
            mode: CursorMode::Pump { seconds },
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: CursorOffset) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Cursor state the buffer needs to reach: queue depth and the disconnect signal.
pub(crate) struct CursorShared {
    id: String,
    queued_bytes: AtomicUsize,
    token: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
    subscription: Mutex<Option<ObserverId>>,
    wake: Notify,
    connected_at: Instant,
}

impl CursorShared {
    fn new(id: String) -> Self {
        Self {
            id,
            queued_bytes: AtomicUsize::new(0),
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            subscription: Mutex::new(None),
            wake: Notify::new(),
            connected_at: Instant::now(),
        }
    }

    fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }
}

enum CursorState {
    Live { from: Bound<Timestamp> },
    Pump { window: VecDeque<Chunk> },
}

/// A listener's read position inside a [`RewindBuffer`].
///
/// Chunks handed out by [`Rewinder::next_chunk`] count as queued until the
/// output layer reports them written through [`Rewinder::flushed`]. The
/// backpressure monitor disconnects cursors whose queue grows past the limit.
pub struct Rewinder {
    seq: u64,
    buffer: Arc<RewindBuffer>,
    shared: Arc<CursorShared>,
    state: CursorState,
}

impl RewindBuffer {
    /// Open a cursor for listener `id`.
    ///
    /// Without an offset, live cursors start `burst` seconds behind the live
    /// edge when that much history exists, else at the live edge; pump
    /// cursors take the most recent window.
    pub fn get_cursor(self: &Arc<Self>, id: impl Into<String>, options: CursorOptions) -> Rewinder {
        let id = id.into();
        let seq = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(CursorShared::new(id));

        let state = {
            let state = self.state.read();
            let settings = &state.settings;
            let store = &state.store;
            let requested = options.offset.map(|offset| match offset {
                CursorOffset::Seconds(seconds) => Position::Offset(settings.offset_chunks(seconds)),
                CursorOffset::Timestamp(ts) => Position::Timestamp(ts),
            });

            match options.mode {
                CursorMode::Live => {
                    let start = requested.unwrap_or_else(|| {
                        let burst = settings.burst_chunks();
                        if burst > 0 && store.len() >= burst {
                            Position::Offset(i64::try_from(burst - 1).unwrap_or(i64::MAX))
                        } else {
                            Position::Offset(0)
                        }
                    });
                    CursorState::Live {
                        from: store
                            .at(start)
                            .map_or(Bound::Unbounded, |chunk| Bound::Included(chunk.ts)),
                    }
                }
                CursorMode::Pump { seconds } => {
                    let count = seconds.map_or_else(
                        || settings.burst_chunks(),
                        |seconds| settings.chunks_for(seconds),
                    );
                    let start = requested.unwrap_or_else(|| {
                        Position::Offset(i64::try_from(count.saturating_sub(1)).unwrap_or(i64::MAX))
                    });
                    CursorState::Pump {
                        window: store.range(start, count).into(),
                    }
                }
            }
        };

        if matches!(state, CursorState::Live { .. }) {
            let waker = Arc::downgrade(&shared);
            let subscription = self.subscribe(Arc::new(move |event: &BufferEvent| {
                if matches!(event, BufferEvent::Append(_) | BufferEvent::Reset) {
                    if let Some(shared) = waker.upgrade() {
                        shared.wake.notify_one();
                    }
                }
            }));
            *shared.subscription.lock() = Some(subscription);
        }

        self.cursors.insert(seq, Arc::clone(&shared));
        self.stats.record_listener_connected();
        debug!(stream = %self.key, listener = %shared.id, "Listener connected");

        Rewinder {
            seq,
            buffer: Arc::clone(self),
            shared,
            state,
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.cursors.len()
    }

    /// Idempotent: only the first reason sticks.
    fn disconnect_cursor(&self, seq: u64, shared: &CursorShared, reason: DisconnectReason) -> bool {
        {
            let mut current = shared.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        shared.token.cancel();
        if let Some(subscription) = shared.subscription.lock().take() {
            self.unsubscribe(subscription);
        }
        self.cursors.remove(&seq);
        self.stats.record_listener_disconnected(reason);
        debug!(
            stream = %self.key,
            listener = %shared.id,
            ?reason,
            connected_for = ?shared.connected_at.elapsed(),
            "Listener disconnected"
        );
        true
    }

    pub(crate) fn disconnect_all(&self, reason: DisconnectReason) -> usize {
        let cursors: Vec<(u64, Arc<CursorShared>)> = self
            .cursors
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        cursors
            .iter()
            .filter(|(seq, shared)| self.disconnect_cursor(*seq, shared, reason))
            .count()
    }

    /// Disconnect every cursor whose queued bytes exceed `max_queued_bytes`.
    pub fn enforce_listener_limits(&self, max_queued_bytes: usize) -> usize {
        let offenders: Vec<(u64, Arc<CursorShared>)> = self
            .cursors
            .iter()
            .filter(|entry| entry.value().queued_bytes() > max_queued_bytes)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut disconnected = 0;
        for (seq, shared) in &offenders {
            warn!(
                stream = %self.key,
                listener = %shared.id,
                queued = shared.queued_bytes(),
                max = max_queued_bytes,
                "Disconnecting slow listener"
            );
            if self.disconnect_cursor(*seq, shared, DisconnectReason::SlowConsumer) {
                disconnected += 1;
            }
        }
        disconnected
    }

    /// Check listener queues every `interval` until `token` is cancelled.
    pub fn spawn_backpressure_monitor(
        self: &Arc<Self>,
        interval: Duration,
        max_queued_bytes: usize,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        buffer.enforce_listener_limits(max_queued_bytes);
                    }
                    () = token.cancelled() => {
                        info!(stream = %buffer.key, "Backpressure monitor stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl Rewinder {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<RewindBuffer> {
        &self.buffer
    }

    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.shared.queued_bytes()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.token.is_cancelled()
    }

    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.shared.reason.lock()
    }

    /// Resolves once the cursor is disconnected for any reason.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await;
    }

    /// Report `bytes` as written to the listener.
    pub fn flushed(&self, bytes: usize) {
        let _ = self
            .shared
            .queued_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                Some(queued.saturating_sub(bytes))
            });
    }

    pub fn disconnect(&self) -> bool {
        self.buffer
            .disconnect_cursor(self.seq, &self.shared, DisconnectReason::Client)
    }

    /// Next chunk for this listener, or `None` once disconnected.
    ///
    /// Live cursors wait for new chunks; a cursor that fell behind the oldest
    /// retained chunk skips ahead to it. Pump cursors finish after their window.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        loop {
            if self.shared.token.is_cancelled() {
                return None;
            }

            let chunk = match &mut self.state {
                CursorState::Pump { window } => {
                    if let Some(chunk) = window.pop_front() {
                        chunk
                    } else {
                        self.buffer.disconnect_cursor(
                            self.seq,
                            &self.shared,
                            DisconnectReason::PumpComplete,
                        );
                        return None;
                    }
                }
                CursorState::Live { from } => {
                    if let Some(chunk) = self.buffer.next_after(*from) {
                        *from = Bound::Excluded(chunk.ts);
                        chunk
                    } else {
                        tokio::select! {
                            () = self.shared.wake.notified() => {}
                            () = self.shared.token.cancelled() => return None,
                        }
                        continue;
                    }
                }
            };

            self.shared
                .queued_bytes
                .fetch_add(chunk.len(), Ordering::Relaxed);
            self.buffer.stats.record_bytes_sent(chunk.len());
            return Some(chunk);
        }
    }
}

impl Drop for Rewinder {
    fn drop(&mut self) {
        self.buffer
            .disconnect_cursor(self.seq, &self.shared, DisconnectReason::Client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RewindSettings;
    use bytes::Bytes;

    fn buffer_with(count: i64) -> Arc<RewindBuffer> {
        let buffer = RewindBuffer::new(
            "test",
            RewindSettings {
                seconds: 60,
                burst: 3,
                chunk_duration: 1000,
                hls: false,
            },
        );
        for i in 1..=count {
            buffer.insert(Chunk::new(i * 1000, 1000, Bytes::from(vec![0u8; 100])));
        }
        buffer
    }

    #[tokio::test]
    async fn test_live_cursor_starts_burst_behind_edge() {
        let buffer = buffer_with(10);
        let mut cursor = buffer.get_cursor("l1", CursorOptions::live());
        assert_eq!(cursor.next_chunk().await.unwrap().ts, 8000);
        assert_eq!(cursor.next_chunk().await.unwrap().ts, 9000);
        assert_eq!(cursor.next_chunk().await.unwrap().ts, 10000);
    }

    #[tokio::test]
    async fn test_live_cursor_short_history_starts_at_edge() {
        let buffer = buffer_with(2);
        let mut cursor = buffer.get_cursor("l1", CursorOptions::live());
        assert_eq!(cursor.next_chunk().await.unwrap().ts, 2000);
    }

    #[tokio::test]
    async fn test_offset_seconds_and_timestamp() {
        let buffer = buffer_with(10);
        let mut by_seconds =
            buffer.get_cursor("a", CursorOptions::live().with_offset(CursorOffset::Seconds(5)));
        assert_eq!(by_seconds.next_chunk().await.unwrap().ts, 5000);

        let mut by_ts = buffer.get_cursor(
            "b",
            CursorOptions::live().with_offset(CursorOffset::Timestamp(4500)),
        );
        assert_eq!(by_ts.next_chunk().await.unwrap().ts, 4000);
    }

    #[tokio::test]
    async fn test_live_cursor_at_max_timestamp_does_not_repeat() {
        let buffer = buffer_with(0);
        buffer.insert(Chunk::new(Timestamp::MAX - 1000, 1000, Bytes::from_static(b"a")));
        buffer.insert(Chunk::new(Timestamp::MAX, 1000, Bytes::from_static(b"b")));
        let mut cursor = buffer.get_cursor("l1", CursorOptions::live().with_offset(CursorOffset::Seconds(1)));

        assert_eq!(cursor.next_chunk().await.unwrap().ts, Timestamp::MAX - 1000);
        assert_eq!(cursor.next_chunk().await.unwrap().ts, Timestamp::MAX);
        let waited = tokio::time::timeout(Duration::from_millis(50), cursor.next_chunk()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_live_cursor_wakes_on_append() {
        let buffer = buffer_with(0);
        let mut cursor = buffer.get_cursor("l1", CursorOptions::live());

        let producer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.insert(Chunk::new(1000, 1000, Bytes::from_static(b"x")));
        });

        let chunk = tokio::time::timeout(Duration::from_secs(5), cursor.next_chunk())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.ts, 1000);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_delivers_window_then_completes() {
        let buffer = buffer_with(10);
        let mut cursor = buffer.get_cursor("p", CursorOptions::pump(Some(4)));

        let mut seen = Vec::new();
        while let Some(chunk) = cursor.next_chunk().await {
            seen.push(chunk.ts);
        }
        assert_eq!(seen, vec![7000, 8000, 9000, 10000]);
        assert_eq!(cursor.disconnect_reason(), Some(DisconnectReason::PumpComplete));
        assert_eq!(buffer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_accounting_and_slow_consumer() {
        let buffer = buffer_with(10);
        let mut cursor = buffer.get_cursor("slow", CursorOptions::live());
        for _ in 0..3 {
            cursor.next_chunk().await.unwrap();
        }
        assert_eq!(cursor.queued_bytes(), 300);
        cursor.flushed(100);
        assert_eq!(cursor.queued_bytes(), 200);

        assert_eq!(buffer.enforce_listener_limits(250), 0);
        assert_eq!(buffer.enforce_listener_limits(150), 1);
        assert_eq!(cursor.disconnect_reason(), Some(DisconnectReason::SlowConsumer));
        assert!(cursor.next_chunk().await.is_none());
        assert_eq!(buffer.stats().snapshot().slow_consumer_disconnects, 1);
    }

    #[tokio::test]
    async fn test_drop_and_close_disconnect() {
        let buffer = buffer_with(3);
        let first = buffer.get_cursor("a", CursorOptions::live());
        let second = buffer.get_cursor("b", CursorOptions::live());
        assert_eq!(buffer.listener_count(), 2);

        drop(first);
        assert_eq!(buffer.listener_count(), 1);

        buffer.close();
        assert_eq!(second.disconnect_reason(), Some(DisconnectReason::BufferClosed));
        assert!(!second.disconnect());
        assert_eq!(buffer.stats().listeners_connected(), 0);
    }
}
