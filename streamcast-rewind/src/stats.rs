use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::cursor::DisconnectReason;
use crate::store::InsertOutcome;

/// Per-stream counters. Every update goes through an explicit `record_*` call
/// made by the buffer or one of its cursors.
#[derive(Debug, Default)]
pub struct StreamStats {
    chunks_appended: AtomicU64,
    chunks_prepended: AtomicU64,
    duplicates_dropped: AtomicU64,
    out_of_order_dropped: AtomicU64,
    chunks_evicted: AtomicU64,
    listeners_connected: AtomicUsize,
    listeners_total: AtomicU64,
    slow_consumer_disconnects: AtomicU64,
    bytes_sent: AtomicU64,
    loads_completed: AtomicU64,
    dumps_completed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub chunks_appended: u64,
    pub chunks_prepended: u64,
    pub duplicates_dropped: u64,
    pub out_of_order_dropped: u64,
    pub chunks_evicted: u64,
    pub listeners_connected: usize,
    pub listeners_total: u64,
    pub slow_consumer_disconnects: u64,
    pub bytes_sent: u64,
    pub loads_completed: u64,
    pub dumps_completed: u64,
}

impl StreamStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_insert(&self, outcome: InsertOutcome, evicted: usize) {
        let counter = match outcome {
            InsertOutcome::Appended => &self.chunks_appended,
            InsertOutcome::Prepended => &self.chunks_prepended,
            InsertOutcome::Duplicate => &self.duplicates_dropped,
            InsertOutcome::OutOfOrder => &self.out_of_order_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.chunks_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    pub fn record_listener_connected(&self) {
        self.listeners_connected.fetch_add(1, Ordering::Relaxed);
        self.listeners_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_disconnected(&self, reason: DisconnectReason) {
        let result = self
            .listeners_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::warn!("Attempted to decrement listener count below zero");
        }
        if reason == DisconnectReason::SlowConsumer {
            self.slow_consumer_disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump(&self) {
        self.dumps_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn listeners_connected(&self) -> usize {
        self.listeners_connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_appended: self.chunks_appended.load(Ordering::Relaxed),
            chunks_prepended: self.chunks_prepended.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            chunks_evicted: self.chunks_evicted.load(Ordering::Relaxed),
            listeners_connected: self.listeners_connected.load(Ordering::Relaxed),
            listeners_total: self.listeners_total.load(Ordering::Relaxed),
            slow_consumer_disconnects: self.slow_consumer_disconnects.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            loads_completed: self.loads_completed.load(Ordering::Relaxed),
            dumps_completed: self.dumps_completed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_outcomes_are_counted_separately() {
        let stats = StreamStats::new();
        stats.record_insert(InsertOutcome::Appended, 2);
        stats.record_insert(InsertOutcome::Prepended, 0);
        stats.record_insert(InsertOutcome::Duplicate, 0);
        stats.record_insert(InsertOutcome::OutOfOrder, 0);

        let snap = stats.snapshot();
        assert_eq!(snap.chunks_appended, 1);
        assert_eq!(snap.chunks_prepended, 1);
        assert_eq!(snap.duplicates_dropped, 1);
        assert_eq!(snap.out_of_order_dropped, 1);
        assert_eq!(snap.chunks_evicted, 2);
    }

    #[test]
    fn test_listener_count_never_underflows() {
        let stats = StreamStats::new();
        stats.record_listener_connected();
        stats.record_listener_disconnected(DisconnectReason::SlowConsumer);
        stats.record_listener_disconnected(DisconnectReason::Client);

        let snap = stats.snapshot();
        assert_eq!(snap.listeners_connected, 0);
        assert_eq!(snap.listeners_total, 1);
        assert_eq!(snap.slow_consumer_disconnects, 1);
    }
}
