// Snapshot wire format, shared by dump files and the live handoff socket.
//
//   header:  u32 LE length | JSON {start_ts, end_ts, chunk_duration, stream_key, hls}
//   record:  u8 length | JSON {ts, meta, duration} | u16 LE length | payload
//
// Records are written newest first, so replaying a snapshot into a buffer
// prepends. A snapshot with no encodable record produces an empty stream
// (no header at all).

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::io::StreamReader;
use tracing::warn;

use crate::chunk::{Chunk, StreamMetadata, Timestamp};
use crate::error::CodecError;

pub const MAX_HEADER_LEN: usize = 64 * 1024;
pub const MAX_META_LEN: usize = u8::MAX as usize;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub chunk_duration: u32,
    #[serde(default)]
    pub stream_key: Option<String>,
    #[serde(default)]
    pub hls: bool,
}

#[derive(Serialize)]
struct RecordMetaRef<'a> {
    ts: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a StreamMetadata>,
    duration: u32,
}

#[derive(Deserialize)]
struct RecordMeta {
    ts: Timestamp,
    #[serde(default)]
    meta: Option<StreamMetadata>,
    duration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFrame {
    Header(SnapshotHeader),
    Chunk(Chunk),
}

/// `tokio_util` codec for the snapshot stream.
///
/// The first frame decoded is always the header; everything after it is a
/// chunk record.
#[derive(Debug, Default)]
pub struct SnapshotCodec {
    header_seen: bool,
}

impl SnapshotCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { header_seen: false }
    }

    pub fn encode_header(header: &SnapshotHeader, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(header)?;
        if body.len() > MAX_HEADER_LEN {
            return Err(CodecError::HeaderTooLarge(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }

    /// Encode one record. Nothing is written to `dst` when the record does not fit
    /// the fixed-width length fields.
    pub fn encode_chunk(chunk: &Chunk, dst: &mut BytesMut) -> Result<(), CodecError> {
        let meta = serde_json::to_vec(&RecordMetaRef {
            ts: chunk.ts,
            meta: chunk.meta.as_ref(),
            duration: chunk.duration,
        })?;
        let meta_len = u8::try_from(meta.len()).map_err(|_| CodecError::MetadataTooLarge(meta.len()))?;
        let payload_len =
            u16::try_from(chunk.data.len()).map_err(|_| CodecError::PayloadTooLarge(chunk.data.len()))?;

        dst.reserve(1 + meta.len() + 2 + chunk.data.len());
        dst.put_u8(meta_len);
        dst.extend_from_slice(&meta);
        dst.put_u16_le(payload_len);
        dst.extend_from_slice(&chunk.data);
        Ok(())
    }

    fn decode_header(src: &mut BytesMut) -> Result<Option<SnapshotHeader>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = (&src[..4]).get_u32_le() as usize;
        if len > MAX_HEADER_LEN {
            return Err(CodecError::HeaderTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(len);
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn decode_chunk(src: &mut BytesMut) -> Result<Option<Chunk>, CodecError> {
        let Some(&meta_len) = src.first() else {
            return Ok(None);
        };
        let meta_len = meta_len as usize;
        if src.len() < 1 + meta_len + 2 {
            return Ok(None);
        }
        let payload_len = (&src[1 + meta_len..3 + meta_len]).get_u16_le() as usize;
        let total = 1 + meta_len + 2 + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(1);
        let meta_bytes = src.split_to(meta_len);
        src.advance(2);
        let data = src.split_to(payload_len).freeze();

        let meta: RecordMeta = serde_json::from_slice(&meta_bytes)?;
        Ok(Some(Chunk {
            ts: meta.ts,
            duration: meta.duration,
            data,
            meta: meta.meta,
        }))
    }
}

impl Decoder for SnapshotCodec {
    type Item = SnapshotFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.header_seen {
            return Ok(Self::decode_chunk(src)?.map(SnapshotFrame::Chunk));
        }
        let header = Self::decode_header(src)?;
        if header.is_some() {
            self.header_seen = true;
        }
        Ok(header.map(SnapshotFrame::Header))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated(buf.len())),
        }
    }
}

impl Encoder<SnapshotFrame> for SnapshotCodec {
    type Error = CodecError;

    fn encode(&mut self, item: SnapshotFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            SnapshotFrame::Header(header) => Self::encode_header(&header, dst),
            SnapshotFrame::Chunk(chunk) => Self::encode_chunk(&chunk, dst),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub records: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Streams a point-in-time copy of a buffer in wire format.
///
/// Owns its chunks, so live inserts into the source buffer after creation
/// never show up in (or corrupt) the snapshot.
#[derive(Debug)]
pub struct SnapshotWriter {
    header: Option<SnapshotHeader>,
    chunks: VecDeque<Chunk>,
}

impl SnapshotWriter {
    /// `chunks` must be ordered oldest first.
    #[must_use]
    pub fn new(header: SnapshotHeader, chunks: VecDeque<Chunk>) -> Self {
        let header = (!chunks.is_empty()).then_some(header);
        Self { header, chunks }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub const fn header(&self) -> Option<&SnapshotHeader> {
        self.header.as_ref()
    }

    /// Lazily encoded frames: the header, then records newest first.
    #[must_use]
    pub fn frames(self) -> SnapshotFrames {
        SnapshotFrames {
            header: self.header,
            chunks: self.chunks,
            buf: BytesMut::new(),
            records: 0,
            skipped: 0,
        }
    }

    pub async fn write_to<W>(self, writer: &mut W) -> Result<WriteSummary, CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut frames = self.frames();
        let mut bytes = 0u64;
        for frame in frames.by_ref() {
            writer.write_all(&frame).await?;
            bytes += frame.len() as u64;
        }
        writer.flush().await?;
        Ok(WriteSummary {
            records: frames.records,
            skipped: frames.skipped,
            bytes,
        })
    }

    /// Expose the snapshot as a byte stream for consumers that pull.
    pub fn into_reader(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(futures::stream::iter(
            self.frames().map(Ok::<Bytes, io::Error>),
        ))
    }
}

pub struct SnapshotFrames {
    header: Option<SnapshotHeader>,
    chunks: VecDeque<Chunk>,
    buf: BytesMut,
    records: usize,
    skipped: usize,
}

impl SnapshotFrames {
    #[must_use]
    pub const fn records(&self) -> usize {
        self.records
    }

    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for SnapshotFrames {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        while let Some(chunk) = self.chunks.pop_back() {
            if let Err(e) = SnapshotCodec::encode_chunk(&chunk, &mut self.buf) {
                self.skipped += 1;
                warn!(ts = chunk.ts, "Skipping chunk in snapshot: {}", e);
                continue;
            }
            self.records += 1;
            let record = self.buf.split();

            // The header goes out with the first record that encodes
            let Some(header) = self.header.take() else {
                return Some(record.freeze());
            };
            if let Err(e) = SnapshotCodec::encode_header(&header, &mut self.buf) {
                warn!("Snapshot header rejected, dropping snapshot: {}", e);
                self.records = 0;
                self.chunks.clear();
                self.buf.clear();
                return None;
            }
            self.buf.extend_from_slice(&record);
            return Some(self.buf.split().freeze());
        }
        None
    }
}
