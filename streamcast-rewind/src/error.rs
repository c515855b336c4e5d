use thiserror::Error;

/// Wire-level failures of the snapshot codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Snapshot header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Chunk metadata too large: {0} bytes (max 255)")]
    MetadataTooLarge(usize),

    #[error("Chunk payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    #[error("Snapshot truncated: {0} trailing bytes")]
    Truncated(usize),
}

#[derive(Error, Debug)]
pub enum RewindError {
    #[error("Timestamp not found: {0}")]
    TimestampNotFound(i64),

    #[error("Buffer is loading: {0}")]
    AlreadyLoading(String),

    #[error("Buffer is dumping: {0}")]
    AlreadyDumping(String),

    #[error("Stream key mismatch: buffer has {expected}, snapshot has {found}")]
    StreamKeyMismatch { expected: String, found: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RewindResult<T> = Result<T, RewindError>;
