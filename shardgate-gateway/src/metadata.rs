//! Chunk metadata persistence.
//!
//! One row per `(file_id, chunk_index)`. The SQLite implementation keeps a single
//! connection behind a mutex and runs every statement on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use shardgate_common::records::{ChunkRecord, ChunkStatus, FileId};

use crate::error::MetadataError;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or overwrite the row for `(record.file_id, record.chunk_index)`.
    ///
    /// `total_chunks` is fixed by the first insert and never overwritten.
    async fn upsert_chunk(&self, record: &ChunkRecord) -> Result<(), MetadataError>;

    /// Update status and timestamp of an existing row.
    ///
    /// Returns `false` without error when no row changed: the row does not exist, or the
    /// update would move a Stored chunk back to Pending.
    async fn set_status(
        &self,
        file_id: &FileId,
        chunk_index: u32,
        status: ChunkStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, MetadataError>;

    /// All rows for a file, ordered by chunk index.
    async fn list_chunks(&self, file_id: &FileId) -> Result<Vec<ChunkRecord>, MetadataError>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MetadataError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, MetadataError> {
        conn.execute_batch("
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS chunks (
                file_id         TEXT NOT NULL,
                chunk_index     INTEGER NOT NULL,
                chunk_size      INTEGER NOT NULL,
                content_hash    TEXT NOT NULL,
                status          TEXT NOT NULL,
                backend_id      INTEGER NOT NULL,
                total_chunks    INTEGER NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (file_id, chunk_index)
            );
        ")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MetadataError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, MetadataError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| MetadataError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| MetadataError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert_chunk(&self, record: &ChunkRecord) -> Result<(), MetadataError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chunks
                    (file_id, chunk_index, chunk_size, content_hash, status, backend_id, total_chunks, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (file_id, chunk_index) DO UPDATE SET
                    chunk_size = excluded.chunk_size,
                    content_hash = excluded.content_hash,
                    status = excluded.status,
                    backend_id = excluded.backend_id,
                    updated_at = excluded.updated_at",
                params![
                    record.file_id.as_str(),
                    record.chunk_index,
                    to_sql_u64(record.chunk_size)?,
                    record.content_hash,
                    record.status.as_str(),
                    to_sql_u64(record.backend_id as u64)?,
                    record.total_chunks,
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_status(
        &self,
        file_id: &FileId,
        chunk_index: u32,
        status: ChunkStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, MetadataError> {
        let file_id = file_id.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE chunks SET status = ?1, updated_at = ?2
                 WHERE file_id = ?3 AND chunk_index = ?4
                   AND NOT (status = 'stored' AND ?1 = 'pending')",
                params![status.as_str(), at.to_rfc3339(), file_id.as_str(), chunk_index],
            )?;
            if changed == 0 {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM chunks WHERE file_id = ?1 AND chunk_index = ?2",
                        params![file_id.as_str(), chunk_index],
                        |row| row.get(0),
                    )
                    .optional()?;
                debug!(
                    file_id = %file_id,
                    chunk_index,
                    requested = %status,
                    current = ?current,
                    "Status update skipped"
                );
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn list_chunks(&self, file_id: &FileId) -> Result<Vec<ChunkRecord>, MetadataError> {
        let file_id = file_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_index, chunk_size, content_hash, status, backend_id, total_chunks, updated_at
                 FROM chunks WHERE file_id = ?1 ORDER BY chunk_index",
            )?;
            let rows = stmt.query_map(params![file_id.as_str()], |row| {
                Ok(RawRow {
                    chunk_index: row.get(0)?,
                    chunk_size: row.get(1)?,
                    content_hash: row.get(2)?,
                    status: row.get(3)?,
                    backend_id: row.get(4)?,
                    total_chunks: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record(&file_id)?);
            }
            Ok(records)
        })
        .await
    }
}

struct RawRow {
    chunk_index: u32,
    chunk_size: i64,
    content_hash: String,
    status: String,
    backend_id: i64,
    total_chunks: u32,
    updated_at: String,
}

impl RawRow {
    fn into_record(self, file_id: &FileId) -> Result<ChunkRecord, MetadataError> {
        let status = ChunkStatus::parse(&self.status)
            .ok_or_else(|| MetadataError::Corrupt(format!("unknown status {:?}", self.status)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| MetadataError::Corrupt(format!("bad timestamp {:?}: {}", self.updated_at, e)))?
            .with_timezone(&Utc);
        let chunk_size = u64::try_from(self.chunk_size)
            .map_err(|_| MetadataError::Corrupt(format!("negative chunk size {}", self.chunk_size)))?;
        let backend_id = usize::try_from(self.backend_id)
            .map_err(|_| MetadataError::Corrupt(format!("bad backend id {}", self.backend_id)))?;

        Ok(ChunkRecord {
            file_id: file_id.clone(),
            chunk_index: self.chunk_index,
            chunk_size,
            content_hash: self.content_hash,
            status,
            backend_id,
            total_chunks: self.total_chunks,
            updated_at,
        })
    }
}

fn to_sql_u64(value: u64) -> Result<i64, MetadataError> {
    i64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("value {} exceeds SQLite range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_id() -> FileId {
        FileId::parse("9b2f6f4e-3c1a-4d2b-8e7f-0a1b2c3d4e5f").unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_list_ordered() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        for index in [2u32, 0, 1] {
            let record = ChunkRecord::pending(file_id(), index, 100 + index as u64, index as usize, 3);
            store.upsert_chunk(&record).await.unwrap();
        }

        let records = store.list_chunks(&file_id()).await.unwrap();
        let indices: Vec<u32> = records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(records[2].chunk_size, 102);
        assert!(records.iter().all(|r| r.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_latest_attempt() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let mut record = ChunkRecord::pending(file_id(), 0, 10, 1, 1);
        store.upsert_chunk(&record).await.unwrap();

        record.content_hash = "abcd".to_string();
        record.backend_id = 2;
        store.upsert_chunk(&record).await.unwrap();

        let records = store.list_chunks(&file_id()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content_hash, "abcd");
        assert_eq!(records[0].backend_id, 2);
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_total() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store
            .upsert_chunk(&ChunkRecord::pending(file_id(), 0, 10, 0, 3))
            .await
            .unwrap();
        store
            .upsert_chunk(&ChunkRecord::pending(file_id(), 0, 12, 1, 4))
            .await
            .unwrap();

        let records = store.list_chunks(&file_id()).await.unwrap();
        assert_eq!(records[0].total_chunks, 3);
        assert_eq!(records[0].chunk_size, 12);
        assert_eq!(records[0].backend_id, 1);
    }

    #[tokio::test]
    async fn test_set_status_transitions() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store
            .upsert_chunk(&ChunkRecord::pending(file_id(), 0, 10, 0, 1))
            .await
            .unwrap();

        let changed = store.set_status(&file_id(), 0, ChunkStatus::Stored, Utc::now()).await.unwrap();
        assert!(changed);

        // Stored never goes back to Pending through set_status.
        let changed = store.set_status(&file_id(), 0, ChunkStatus::Pending, Utc::now()).await.unwrap();
        assert!(!changed);

        let records = store.list_chunks(&file_id()).await.unwrap();
        assert_eq!(records[0].status, ChunkStatus::Stored);
    }

    #[tokio::test]
    async fn test_set_status_missing_row_is_noop() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        let changed = store.set_status(&file_id(), 4, ChunkStatus::Stored, Utc::now()).await.unwrap();
        assert!(!changed);
        assert!(store.list_chunks(&file_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_file_lists_nothing() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store
            .upsert_chunk(&ChunkRecord::pending(file_id(), 0, 10, 0, 1))
            .await
            .unwrap();
        let other = FileId::generate();
        assert!(store.list_chunks(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_persists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");
        {
            let store = SqliteMetadataStore::open(&path).unwrap();
            store
                .upsert_chunk(&ChunkRecord::pending(file_id(), 0, 10, 0, 1))
                .await
                .unwrap();
            store.set_status(&file_id(), 0, ChunkStatus::Stored, Utc::now()).await.unwrap();
        }
        let store = SqliteMetadataStore::open(&path).unwrap();
        let records = store.list_chunks(&file_id()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ChunkStatus::Stored);
    }
}
