//! File identifiers and per-chunk metadata records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token naming one ingested file's chunk set.
///
/// Minted once per ingest as a random UUID. It carries no structural meaning and is never
/// derived from file content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed file identifier: {0:?}")]
pub struct InvalidFileId(pub String);

impl FileId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied identifier, normalising it to the hyphenated lowercase form.
    pub fn parse(raw: &str) -> Result<Self, InvalidFileId> {
        let trimmed = raw.trim();
        Uuid::parse_str(trimmed)
            .map(|uuid| Self(uuid.hyphenated().to_string()))
            .map_err(|_| InvalidFileId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FileId {
    type Error = InvalidFileId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write state of one chunk. Only ever moves Pending -> Stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Bytes are streaming or the backend has not confirmed the write.
    Pending,
    /// The backend confirmed the write completed.
    Stored,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Stored => "stored",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ChunkStatus::Pending),
            "stored" => Some(ChunkStatus::Stored),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata row for one chunk, keyed by `(file_id, chunk_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub file_id: FileId,
    pub chunk_index: u32,
    pub chunk_size: u64,
    /// Hex SHA-256 of the chunk bytes; empty until the transfer has finished.
    pub content_hash: String,
    pub status: ChunkStatus,
    pub backend_id: usize,
    pub total_chunks: u32,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// A record for a chunk whose bytes are about to start streaming.
    pub fn pending(
        file_id: FileId,
        chunk_index: u32,
        chunk_size: u64,
        backend_id: usize,
        total_chunks: u32,
    ) -> Self {
        Self {
            file_id,
            chunk_index,
            chunk_size,
            content_hash: String::new(),
            status: ChunkStatus::Pending,
            backend_id,
            total_chunks,
            updated_at: Utc::now(),
        }
    }
}
