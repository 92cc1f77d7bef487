use std::fmt;
use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::records::FileId;

/// Byte stream handed to a backend on upload and returned by it on download.
pub type ChunkReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("backend rejected request: HTTP {status} - {body}")]
    Rejected { status: u16, body: String },
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait implemented by all chunk storage backends.
///
/// A backend only moves the bytes of single objects. Placement, hashing and status tracking
/// happen in the gateway; the backend is responsible for storing exactly what it is given
/// and handing it back unchanged.
#[async_trait::async_trait]
pub trait ChunkBackend: Send + Sync {
    /// Store exactly `length` bytes read from `body` under `key`.
    ///
    /// Returns only once the write is durable. A body that ends early is an error and must
    /// not leave a readable object behind.
    async fn upload(&self, key: &ChunkKey, length: u64, body: ChunkReader) -> Result<(), BackendError>;

    /// Open the object stored under `key` as a byte stream.
    async fn download(&self, key: &ChunkKey) -> Result<ChunkReader, BackendError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// Address of one chunk object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_index: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_index: u32) -> Self {
        Self { file_id, chunk_index }
    }

    pub fn object_name(&self) -> String {
        object_name(self.file_id.as_str(), self.chunk_index)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_name())
    }
}

/// Object name for a chunk on its backend.
/// Scheme: `{file_id}_chunk_{index}`
pub fn object_name(file_id: &str, chunk_index: u32) -> String {
    format!("{}_chunk_{}", file_id, chunk_index)
}
