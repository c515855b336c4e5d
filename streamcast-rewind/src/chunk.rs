use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Inline stream metadata valid as of the chunk it rides on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl StreamMetadata {
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            url: None,
        }
    }
}

/// One unit of audio history covering `[ts, ts + duration)`.
///
/// `data` is opaque to the buffer. Cloning is cheap: the payload is a `Bytes`
/// handle, so fan-out to cursors and snapshots never copies audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub ts: Timestamp,
    pub duration: u32,
    pub data: Bytes,
    pub meta: Option<StreamMetadata>,
}

impl Chunk {
    #[must_use]
    pub fn new(ts: Timestamp, duration: u32, data: impl Into<Bytes>) -> Self {
        Self {
            ts,
            duration,
            data: data.into(),
            meta: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: StreamMetadata) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Exclusive end of the validity interval, clamped at `Timestamp::MAX`.
    #[must_use]
    pub const fn end(&self) -> Timestamp {
        self.ts.saturating_add(self.duration as Timestamp)
    }

    #[must_use]
    pub const fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.ts && ts < self.end()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One-time description of a producer's output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVitals {
    pub stream_key: String,
    pub frames_per_second: f64,
    pub chunk_duration: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_interval_is_half_open() {
        let chunk = Chunk::new(1000, 500, Bytes::from_static(b"abc"));
        assert!(chunk.contains(1000));
        assert!(chunk.contains(1499));
        assert!(!chunk.contains(1500));
        assert!(!chunk.contains(999));
        assert_eq!(chunk.end(), 1500);
        assert_eq!(chunk.len(), 3);
    }
}
