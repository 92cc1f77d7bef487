//! Local directory chunk store.
//!
//! Objects land under `<base>/<first two chars of file id>/<object name>`. Every write goes
//! to a uniquely named temp file which is fsynced and renamed into place, so a reader only
//! ever sees complete objects and concurrent writers of the same key do not clobber each
//! other's partial data.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use shardgate_common::backend::{BackendError, ChunkBackend, ChunkKey, ChunkReader};

pub struct DirectoryStore {
    base_path: PathBuf,
}

impl DirectoryStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    /// Create the base directory if it does not exist yet.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// On-disk location of an object. File ids are validated UUIDs, so the name is a
    /// single safe path component.
    pub fn object_path(&self, key: &ChunkKey) -> PathBuf {
        let id = key.file_id.as_str();
        let shard = id.get(..2).unwrap_or("00");
        self.base_path.join(shard).join(key.object_name())
    }

    /// Open a stored object, returning the reader and its length.
    pub async fn open_chunk(&self, key: &ChunkKey) -> Result<(ChunkReader, u64), BackendError> {
        let path = self.object_path(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.object_name()));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((Box::pin(file), len))
    }
}

/// Removes a temp file on drop unless the write completed.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }
}

#[async_trait]
impl ChunkBackend for DirectoryStore {
    async fn upload(&self, key: &ChunkKey, length: u64, body: ChunkReader) -> Result<(), BackendError> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = dest.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let mut guard = TempGuard::new(tmp_path.clone());

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut limited = body.take(length);
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        if written != length {
            return Err(BackendError::LengthMismatch { expected: length, actual: written });
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest).await?;
        guard.disarm();

        debug!(key = %key, bytes = written, "Chunk stored");
        Ok(())
    }

    async fn download(&self, key: &ChunkKey) -> Result<ChunkReader, BackendError> {
        let (reader, _) = self.open_chunk(key).await?;
        Ok(reader)
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let meta = tokio::fs::metadata(&self.base_path).await?;
        if !meta.is_dir() {
            return Err(BackendError::Io(io::Error::other(format!(
                "{} is not a directory",
                self.base_path.display()
            ))));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.base_path.display())
    }
}
