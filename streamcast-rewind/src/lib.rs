// streamcast-rewind - time-indexed rewind buffer for live audio
//
// - store       - ordered chunk sequence with eviction
// - codec       - snapshot wire format (disk dumps and live handoff)
// - buffer      - per-stream orchestrator, observers, load/dump
// - cursor      - listener read positions and backpressure
// - source      - producer attachment
// - persistence - dump files and the shared dump queue

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod persistence;
pub mod source;
pub mod stats;
pub mod store;

use std::sync::Arc;

use dashmap::DashMap;

pub use buffer::{
    Activity, BufferEvent, BufferObserver, BufferStatus, LoadSummary, ObserverId, RewindBuffer,
    RewindSettings,
};
pub use chunk::{Chunk, SourceVitals, StreamMetadata, Timestamp};
pub use codec::{SnapshotCodec, SnapshotFrame, SnapshotHeader, SnapshotWriter, WriteSummary};
pub use cursor::{CursorMode, CursorOffset, CursorOptions, DisconnectReason, Rewinder};
pub use error::{CodecError, RewindError, RewindResult};
pub use persistence::{DumpOutcome, Dumper, LoadOutcome, PersistenceManager};
pub use source::{Source, SourceEvent, SourceKind, SourceSender};
pub use stats::{StatsSnapshot, StreamStats};
pub use store::{ChunkStore, InsertOutcome, Position};

/// Buffers keyed by stream key.
pub type BufferRegistry = DashMap<String, Arc<RewindBuffer>>;
