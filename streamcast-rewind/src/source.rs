use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::buffer::RewindBuffer;
use crate::chunk::{Chunk, SourceVitals};

/// Which kind of producer feeds a buffer. Fixed when the source is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Direct encoder connection.
    Primary,
    /// Re-encoded output of another stream.
    Transcoder { upstream: String },
    /// Stand-in audio while the real source is away.
    Fallback { reason: String },
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Transcoder { upstream } => write!(f, "transcoder({upstream})"),
            Self::Fallback { reason } => write!(f, "fallback({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Vitals(SourceVitals),
    Chunk(Chunk),
}

pub type SourceSender = mpsc::Sender<SourceEvent>;

/// Receiving end of a producer. Created with [`Source::channel`].
pub struct Source {
    kind: SourceKind,
    events: mpsc::Receiver<SourceEvent>,
}

impl Source {
    #[must_use]
    pub fn channel(kind: SourceKind, capacity: usize) -> (SourceSender, Self) {
        let (tx, events) = mpsc::channel(capacity);
        (tx, Self { kind, events })
    }

    #[must_use]
    pub const fn kind(&self) -> &SourceKind {
        &self.kind
    }
}

impl RewindBuffer {
    /// Drain `source` into this buffer on a background task.
    ///
    /// Replaces any previously attached source. Vitals are applied as they
    /// arrive; chunks go through the normal insert path.
    pub fn attach_source(self: &Arc<Self>, source: Source) {
        let Source { kind, mut events } = source;
        let generation = self.next_source.fetch_add(1, Ordering::Relaxed);
        info!(stream = %self.key, source = %kind, "Source attached");

        // Held until the handle is stored so an early end sees its own generation
        let mut slot = self.source_task.lock();
        self.state.write().source = Some(kind.clone());

        let buffer = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut chunks = 0u64;
            while let Some(event) = events.recv().await {
                match event {
                    SourceEvent::Vitals(vitals) => buffer.apply_vitals(vitals),
                    SourceEvent::Chunk(chunk) => {
                        buffer.insert(chunk);
                        chunks += 1;
                    }
                }
            }
            debug!(stream = %buffer.key, source = %kind, chunks, "Source ended");
            buffer.source_ended(generation);
        });

        if let Some((_, previous)) = slot.replace((generation, task)) {
            previous.abort();
        }
    }

    /// Stop the attached source task, if any.
    pub fn detach_source(&self) -> bool {
        let Some((_, task)) = self.source_task.lock().take() else {
            return false;
        };
        task.abort();
        self.state.write().source = None;
        info!(stream = %self.key, "Source detached");
        true
    }

    fn source_ended(&self, generation: u64) {
        let mut slot = self.source_task.lock();
        if slot.as_ref().is_some_and(|(current, _)| *current == generation) {
            slot.take();
            self.state.write().source = None;
        }
    }
}
