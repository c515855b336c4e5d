use std::collections::VecDeque;

use crate::chunk::{Chunk, Timestamp};
use crate::error::{RewindError, RewindResult};

/// Read position inside a [`ChunkStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Chunk count back from the live edge. 0 is the newest chunk.
    Offset(i64),
    /// Absolute time in milliseconds.
    Timestamp(Timestamp),
}

/// How an insert was classified against the current boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Appended,
    Prepended,
    /// Timestamp already present; the new chunk was discarded.
    Duplicate,
    /// Timestamp strictly inside the buffered range with no matching chunk; discarded.
    OutOfOrder,
}

impl InsertOutcome {
    #[must_use]
    pub const fn is_stored(self) -> bool {
        matches!(self, Self::Appended | Self::Prepended)
    }
}

#[derive(Debug)]
pub struct Insertion {
    pub outcome: InsertOutcome,
    /// Chunks removed by the eviction pass, oldest first.
    pub evicted: Vec<Chunk>,
}

/// Ordered in-memory sequence of chunks, oldest at the front.
///
/// Invariant: timestamps strictly ascend front to back. Cloning is cheap
/// relative to the audio held since payloads are reference counted.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: VecDeque<Chunk>,
    max_length: Option<usize>,
    bytes: usize,
    duration_ms: u64,
}

impl ChunkStore {
    #[must_use]
    pub fn new(max_length: Option<usize>) -> Self {
        Self {
            max_length,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Change the retention bound. Existing chunks beyond the new bound are
    /// kept until the next insert runs the eviction pass.
    pub fn set_max_length(&mut self, max_length: Option<usize>) {
        self.max_length = max_length;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Payload bytes held.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Sum of chunk durations in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    #[must_use]
    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Chunk> {
        self.chunks.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Chunk> + ExactSizeIterator {
        self.chunks.iter()
    }

    pub fn insert(&mut self, chunk: Chunk) -> Insertion {
        let outcome = self.place(chunk);
        let evicted = self.evict();
        Insertion { outcome, evicted }
    }

    fn place(&mut self, chunk: Chunk) -> InsertOutcome {
        let (first_ts, last_ts) = match (self.chunks.front(), self.chunks.back()) {
            (Some(first), Some(last)) => (first.ts, last.ts),
            _ => {
                self.account_added(&chunk);
                self.chunks.push_back(chunk);
                return InsertOutcome::Appended;
            }
        };

        if chunk.ts > last_ts {
            self.account_added(&chunk);
            self.chunks.push_back(chunk);
            InsertOutcome::Appended
        } else if chunk.ts < first_ts {
            self.account_added(&chunk);
            self.chunks.push_front(chunk);
            InsertOutcome::Prepended
        } else if chunk.ts == first_ts
            || chunk.ts == last_ts
            || self.chunks.binary_search_by_key(&chunk.ts, |c| c.ts).is_ok()
        {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::OutOfOrder
        }
    }

    fn evict(&mut self) -> Vec<Chunk> {
        let Some(max) = self.max_length else {
            return Vec::new();
        };
        let excess = self.chunks.len().saturating_sub(max);
        let evicted: Vec<Chunk> = self.chunks.drain(..excess).collect();
        for chunk in &evicted {
            self.account_removed(chunk);
        }
        evicted
    }

    fn account_added(&mut self, chunk: &Chunk) {
        self.bytes += chunk.len();
        self.duration_ms += u64::from(chunk.duration);
    }

    fn account_removed(&mut self, chunk: &Chunk) {
        self.bytes = self.bytes.saturating_sub(chunk.len());
        self.duration_ms = self.duration_ms.saturating_sub(u64::from(chunk.duration));
    }

    /// Drop every chunk, returning how many were held.
    pub fn clear(&mut self) -> usize {
        let n = self.chunks.len();
        self.chunks.clear();
        self.bytes = 0;
        self.duration_ms = 0;
        n
    }

    /// Index (0 = oldest) addressed by `position`, clamped into the store.
    #[must_use]
    pub fn index_of(&self, position: Position) -> Option<usize> {
        let last_idx = self.chunks.len().checked_sub(1)?;
        match position {
            Position::Offset(offset) => {
                let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
                Some(last_idx - offset.min(last_idx))
            }
            Position::Timestamp(ts) => Some(self.nearest_index(ts, last_idx)),
        }
    }

    fn nearest_index(&self, ts: Timestamp, last_idx: usize) -> usize {
        // Index of the newest chunk starting at or before ts
        let at_or_before = self.chunks.partition_point(|c| c.ts <= ts);
        if at_or_before == 0 {
            return 0;
        }
        let idx = at_or_before - 1;
        if idx == last_idx || self.chunks[idx].contains(ts) {
            return idx;
        }

        // In a gap: pick whichever neighbouring boundary is closer, older on a tie
        let to_prev = ts.saturating_sub(self.chunks[idx].end());
        let to_next = self.chunks[idx + 1].ts.saturating_sub(ts);
        if to_prev <= to_next {
            idx
        } else {
            idx + 1
        }
    }

    #[must_use]
    pub fn at(&self, position: Position) -> Option<&Chunk> {
        self.index_of(position).map(|idx| &self.chunks[idx])
    }

    /// Strict timestamp lookup; fails only when the store is empty.
    pub fn find(&self, ts: Timestamp) -> RewindResult<&Chunk> {
        self.at(Position::Timestamp(ts))
            .ok_or(RewindError::TimestampNotFound(ts))
    }

    /// Up to `count` contiguous chunks starting at `position`, moving toward the live edge.
    #[must_use]
    pub fn range(&self, position: Position, count: usize) -> Vec<Chunk> {
        let Some(start) = self.index_of(position) else {
            return Vec::new();
        };
        let end = start.saturating_add(count).min(self.chunks.len());
        self.chunks.range(start..end).cloned().collect()
    }

    /// Oldest chunk whose timestamp is at or after `ts`.
    #[must_use]
    pub fn first_at_or_after(&self, ts: Timestamp) -> Option<&Chunk> {
        let idx = self.chunks.partition_point(|c| c.ts < ts);
        self.chunks.get(idx)
    }

    #[must_use]
    pub fn first_after(&self, ts: Timestamp) -> Option<&Chunk> {
        let idx = self.chunks.partition_point(|c| c.ts <= ts);
        self.chunks.get(idx)
    }
}
