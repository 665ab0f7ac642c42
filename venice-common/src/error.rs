//! Error types for the Venice ingestion core.
//!
//! Mirrors the layered error hierarchy of the storage/cluster crates: one
//! sub-enum per subsystem, converted into the top-level `Error` with
//! `#[from]` so call sites can use `?` across crate boundaries.

use thiserror::Error;

/// Result type alias using Venice's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ingestion core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("DIV error: {0}")]
    Div(#[from] DivError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should take a partition to `ERRORED`, per the
    /// fatal/transient split in the ingestion error-handling design.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Ingest(e) => e.is_fatal(),
            Error::Div(e) => e.is_fatal(),
            Error::Storage(_) => true,
            Error::Config(_) => true,
            Error::Serialization(_) => true,
            Error::Internal(_) => true,
            Error::Cluster(_) => false,
            Error::Protocol(_) => false,
            Error::Io(_) => false,
        }
    }
}

/// Errors raised by the Partition Ingestor state machine.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("segment gap (before_eop={before_eop})")]
    SegmentGap { before_eop: bool },

    #[error("checksum mismatch (tolerated={tolerated})")]
    ChecksumMismatch { tolerated: bool },

    #[error("unknown schema id: {0}")]
    SchemaIdUnknown(u32),

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("version-topic produce failed: {0}")]
    VersionTopicProduceFailed(String),

    #[error("local store commit failed: {0}")]
    LocalStoreCommitFailed(String),

    #[error("envelope protocol too old: local={local}, required={required}")]
    EnvelopeProtocolTooOld { local: u32, required: u32 },

    #[error("partition already errored")]
    AlreadyErrored,
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::SegmentGap { before_eop } => *before_eop,
            IngestError::ChecksumMismatch { tolerated } => !tolerated,
            IngestError::SchemaIdUnknown(_) => true,
            IngestError::CorruptCheckpoint(_) => true,
            IngestError::EnvelopeProtocolTooOld { .. } => true,
            IngestError::AlreadyErrored => true,
            IngestError::UpstreamUnavailable(_) => false,
            IngestError::VersionTopicProduceFailed(_) => false,
            IngestError::LocalStoreCommitFailed(_) => false,
        }
    }
}

/// Errors raised by the DIV validator.
#[derive(Error, Debug)]
pub enum DivError {
    #[error("missing segment head for producer {guid} segment {segment}")]
    MissingHead { guid: String, segment: i32 },

    #[error("data missing for producer {guid} segment {segment}: expected seq {expected}, got {got}")]
    DataMissing {
        guid: String,
        segment: i32,
        expected: i64,
        got: i64,
    },
}

impl DivError {
    pub fn is_fatal(&self) -> bool {
        // Callers decide fatality against the before/after-EOP tolerance
        // rule in IngestError::SegmentGap; DivError itself is always
        // reported, never silently dropped.
        true
    }
}

/// Local key/value store errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(i32),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("WAL error: {0}")]
    WalError(String),
}

/// Cluster membership oracle errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("no leader elected for partition {0}")]
    NoLeader(i32),

    #[error("not leader, leader is: {0}")]
    NotLeader(String),

    #[error("quorum not reached")]
    QuorumNotReached,
}

/// Wire-envelope / topic protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unsupported control message: {0}")]
    UnsupportedControlMessage(String),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("incomplete message")]
    IncompleteMessage,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
