use shardgate_common::backend::BackendError;
use shardgate_common::records::FileId;

/// Failure of an ingest or retrieve operation.
#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("failed to read source: {0}")]
    Source(#[source] std::io::Error),
    #[error("transfer of chunk {chunk_index} via {backend} failed: {source}")]
    Transfer {
        chunk_index: u32,
        backend: String,
        #[source]
        source: TransferError,
    },
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("metadata store error: {0}")]
    Persistence(#[from] MetadataError),
    #[error("failed to write to sink: {0}")]
    Sink(#[source] std::io::Error),
    #[error("worker task failed: {0}")]
    Task(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Failure moving one chunk between the gateway and a backend.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("body ended after {actual} of {expected} bytes")]
    ShortBody { expected: u64, actual: u64 },
    #[error("cancelled")]
    Cancelled,
}

/// A stored file failed the completeness or content checks.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("no chunks recorded for file {0}")]
    UnknownFile(FileId),
    #[error("chunk {chunk_index} has not been stored")]
    NotStored { chunk_index: u32 },
    #[error("chunk {chunk_index} claims {recorded} total chunks, expected {expected}")]
    ChunkCountMismatch { chunk_index: u32, recorded: u32, expected: u32 },
    #[error("chunk {chunk_index} is missing")]
    MissingChunk { chunk_index: u32 },
    #[error("chunk {chunk_index} is recorded more than once")]
    DuplicateChunk { chunk_index: u32 },
    #[error("chunk {chunk_index} is outside the declared range of {total} chunks")]
    UnexpectedChunk { chunk_index: u32, total: u32 },
    #[error("chunk {chunk_index} was written to backend {recorded} but placement now resolves to {computed}")]
    PlacementMismatch { chunk_index: u32, recorded: usize, computed: usize },
    #[error("chunk {chunk_index} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { chunk_index: u32, expected: u64, actual: u64 },
    #[error("chunk {chunk_index} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { chunk_index: u32, expected: String, actual: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database worker failed: {0}")]
    Worker(String),
    #[error("database lock poisoned")]
    Poisoned,
}

impl ChunkerError {
    pub(crate) fn transfer(chunk_index: u32, backend: String, source: TransferError) -> Self {
        match source {
            TransferError::Cancelled => ChunkerError::Cancelled,
            source => ChunkerError::Transfer { chunk_index, backend, source },
        }
    }
}
