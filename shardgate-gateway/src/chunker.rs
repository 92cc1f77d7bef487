//! Ingest and retrieve orchestration.
//!
//! Ingest reads the source exactly once. Each chunk gets its own in-memory pipe and upload
//! task; the source is copied into the pipes in order while earlier chunks are still
//! awaiting backend confirmation. The first failing task cancels the rest, and an
//! identifier is only handed out once every chunk is Stored.
//!
//! Retrieve verifies the record set up front, then streams chunks in index order, checking
//! each chunk's length and hash against its record.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shardgate_common::backend::{BackendError, ChunkBackend, ChunkKey, ChunkReader};
use shardgate_common::chunk::{self, DEFAULT_CHUNK_COUNT, MAX_CHUNK_COUNT};
use shardgate_common::records::{ChunkRecord, ChunkStatus, FileId};

use crate::backend::BackendSet;
use crate::error::ChunkerError;
use crate::metadata::MetadataStore;
use crate::transfer;
use crate::verify::{self, RetrievalPlan};

/// Buffer between the source reader and one chunk's upload.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest buffer reserved up front for a prefetched chunk.
const MAX_PREALLOC: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkerSettings {
    pub default_chunk_count: u32,
    pub max_concurrent_uploads: usize,
    /// Chunks fetched ahead of the one being written. 1 streams straight to the sink.
    pub download_window: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            default_chunk_count: DEFAULT_CHUNK_COUNT,
            max_concurrent_uploads: 4,
            download_window: 1,
        }
    }
}

#[derive(Clone)]
pub struct ChunkerService {
    backends: BackendSet,
    metadata: Arc<dyn MetadataStore>,
    settings: ChunkerSettings,
}

/// Why feeding the chunk pipes stopped early.
enum FeedStop {
    Failed(ChunkerError),
    /// A sibling task failed or the caller cancelled; the real cause is in the task results.
    Interrupted,
}

async fn cancellable<T, E, F>(token: &CancellationToken, fut: F) -> Result<T, ChunkerError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ChunkerError>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ChunkerError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

impl ChunkerService {
    pub fn new(backends: BackendSet, metadata: Arc<dyn MetadataStore>, settings: ChunkerSettings) -> Self {
        Self { backends, metadata, settings }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    /// Split `source` into chunks, place and upload them, and return the new file id.
    ///
    /// `declared_size` must be the exact number of bytes `source` yields; a source that
    /// ends early or runs past it is a validation error. Nothing is returned for a
    /// partially stored file.
    pub async fn ingest<R>(
        &self,
        mut source: R,
        declared_size: u64,
        chunk_count: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<FileId, ChunkerError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let chunk_count = chunk_count.unwrap_or(self.settings.default_chunk_count);
        if chunk_count == 0 || chunk_count > MAX_CHUNK_COUNT {
            return Err(ChunkerError::Validation(format!(
                "chunk count must be between 1 and {}, got {}",
                MAX_CHUNK_COUNT, chunk_count
            )));
        }
        if cancel.is_cancelled() {
            return Err(ChunkerError::Cancelled);
        }

        let file_id = FileId::generate();
        let sizes = chunk::split(declared_size, chunk_count);
        let token = cancel.child_token();
        let mut tasks = JoinSet::new();

        info!(file_id = %file_id, size = declared_size, chunks = chunk_count, "Ingest started");

        let fed = self.feed(&mut source, &file_id, &sizes, &mut tasks, &token).await;
        if fed.is_err() {
            token.cancel();
        }
        let failure = settle(&mut tasks).await;

        let error = match (fed, failure) {
            (Ok(()), None) => {
                info!(file_id = %file_id, size = declared_size, chunks = chunk_count, "Ingest complete");
                return Ok(file_id);
            }
            (Ok(()), Some(e)) | (Err(FeedStop::Interrupted), Some(e)) => e,
            (Err(FeedStop::Failed(e)), _) => e,
            (Err(FeedStop::Interrupted), None) => {
                if cancel.is_cancelled() {
                    ChunkerError::Cancelled
                } else {
                    ChunkerError::Task("chunk pipe closed unexpectedly".to_string())
                }
            }
        };

        warn!(file_id = %file_id, error = %error, "Ingest failed");
        Err(error)
    }

    async fn feed<R>(
        &self,
        source: &mut R,
        file_id: &FileId,
        sizes: &[u64],
        tasks: &mut JoinSet<Result<(), ChunkerError>>,
        token: &CancellationToken,
    ) -> Result<(), FeedStop>
    where
        R: AsyncRead + Unpin + Send,
    {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_uploads));
        let total = sizes.len() as u32;
        let mut consumed = 0u64;

        for (chunk_index, &length) in (0u32..).zip(sizes) {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FeedStop::Interrupted),
                permit = Arc::clone(&permits).acquire_owned() => permit.map_err(|_| {
                    FeedStop::Failed(ChunkerError::Task("upload permits closed".to_string()))
                })?,
            };

            let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
            let service = self.clone();
            let task_file_id = file_id.clone();
            let task_token = token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = service
                    .store_chunk(task_file_id, chunk_index, length, total, Box::pin(reader), &task_token)
                    .await;
                if result.is_err() {
                    task_token.cancel();
                }
                result
            });

            let mut limited = (&mut *source).take(length);
            let copied = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FeedStop::Interrupted),
                copied = tokio::io::copy(&mut limited, &mut writer) => copied,
            };
            drop(writer);

            match copied {
                Ok(n) if n == length => consumed += n,
                Ok(n) => {
                    return Err(FeedStop::Failed(ChunkerError::Validation(format!(
                        "source ended after {} of {} declared bytes",
                        consumed + n,
                        sizes.iter().sum::<u64>()
                    ))));
                }
                // The upload task dropped its end of the pipe, so it has failed.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(FeedStop::Interrupted),
                Err(e) => return Err(FeedStop::Failed(ChunkerError::Source(e))),
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = flatten(joined) {
                    return Err(FeedStop::Failed(e));
                }
            }
        }

        // The source must end exactly at the declared size.
        let mut extra = [0u8; 1];
        let trailing = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FeedStop::Interrupted),
            read = source.read(&mut extra) => read,
        };
        match trailing {
            Ok(0) => Ok(()),
            Ok(_) => Err(FeedStop::Failed(ChunkerError::Validation(format!(
                "source holds more than the {} declared bytes",
                consumed
            )))),
            Err(e) => Err(FeedStop::Failed(ChunkerError::Source(e))),
        }
    }

    /// Upload one chunk and walk its record from Pending to Stored.
    async fn store_chunk(
        &self,
        file_id: FileId,
        chunk_index: u32,
        length: u64,
        total_chunks: u32,
        body: ChunkReader,
        token: &CancellationToken,
    ) -> Result<(), ChunkerError> {
        let (backend_id, backend) = self.backends.for_chunk(&file_id, chunk_index);
        let backend = Arc::clone(backend);

        let mut record = ChunkRecord::pending(file_id.clone(), chunk_index, length, backend_id, total_chunks);
        cancellable(token, self.metadata.upsert_chunk(&record)).await?;

        let key = ChunkKey::new(file_id.clone(), chunk_index);
        let digest = transfer::upload_chunk(backend.as_ref(), &key, length, body, token)
            .await
            .map_err(|e| ChunkerError::transfer(chunk_index, backend.describe(), e))?;

        record.content_hash = digest.hex;
        record.updated_at = Utc::now();
        cancellable(token, self.metadata.upsert_chunk(&record)).await?;
        cancellable(
            token,
            self.metadata.set_status(&file_id, chunk_index, ChunkStatus::Stored, Utc::now()),
        )
        .await?;

        debug!(
            file_id = %file_id,
            chunk_index,
            backend = backend_id,
            bytes = length,
            "Chunk stored"
        );
        Ok(())
    }

    /// Fetch and verify the record set of a file without reading any chunk bytes.
    pub async fn open(&self, file_id: &FileId, cancel: &CancellationToken) -> Result<RetrievalPlan, ChunkerError> {
        let records = cancellable(cancel, self.metadata.list_chunks(file_id)).await?;
        let plan = verify::verify_complete(file_id, records, self.backends.len())?;
        Ok(plan)
    }

    /// Write the chunks of a verified plan to `sink` in index order.
    ///
    /// Returns the number of bytes written. A corrupt chunk fails the call; with a window of
    /// 1 some of its bytes may already have reached the sink.
    pub async fn stream<W>(
        &self,
        plan: &RetrievalPlan,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, ChunkerError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let written = if self.settings.download_window <= 1 {
            self.stream_direct(plan, sink, cancel).await?
        } else {
            self.stream_windowed(plan, sink, cancel).await?
        };
        cancellable(cancel, async { sink.flush().await.map_err(ChunkerError::Sink) }).await?;

        info!(file_id = %plan.file_id, bytes = written, chunks = plan.chunks.len(), "File retrieved");
        Ok(written)
    }

    /// `open` followed by `stream`.
    pub async fn retrieve<W>(
        &self,
        file_id: &FileId,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, ChunkerError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let plan = self.open(file_id, cancel).await?;
        self.stream(&plan, sink, cancel).await
    }

    async fn stream_direct<W>(
        &self,
        plan: &RetrievalPlan,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, ChunkerError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut written = 0u64;
        for record in &plan.chunks {
            let (_, backend) = self.backends.for_chunk(&plan.file_id, record.chunk_index);
            let key = ChunkKey::new(plan.file_id.clone(), record.chunk_index);
            let digest = transfer::download_chunk(backend.as_ref(), &key, sink, cancel)
                .await
                .map_err(|e| ChunkerError::transfer(record.chunk_index, backend.describe(), e))?;
            verify::check_digest(record, &digest)?;
            written += digest.bytes;
            debug!(file_id = %plan.file_id, chunk_index = record.chunk_index, bytes = digest.bytes, "Chunk streamed");
        }
        Ok(written)
    }

    async fn stream_windowed<W>(
        &self,
        plan: &RetrievalPlan,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, ChunkerError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let token = cancel.child_token();
        let _guard = token.clone().drop_guard();
        let window = self.settings.download_window;

        let mut queue: VecDeque<JoinHandle<Result<Vec<u8>, ChunkerError>>> = VecDeque::with_capacity(window);
        let mut records = plan.chunks.iter();
        let mut written = 0u64;

        loop {
            while queue.len() < window {
                let Some(record) = records.next() else { break };
                let (_, backend) = self.backends.for_chunk(&plan.file_id, record.chunk_index);
                queue.push_back(tokio::spawn(fetch_verified(
                    Arc::clone(backend),
                    plan.file_id.clone(),
                    record.clone(),
                    token.clone(),
                )));
            }

            let Some(handle) = queue.pop_front() else { break };
            let fetched = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ChunkerError::Task(e.to_string())),
            };
            let outcome = match fetched {
                Ok(data) => {
                    let len = data.len() as u64;
                    cancellable(cancel, async { sink.write_all(&data).await.map_err(ChunkerError::Sink) })
                        .await
                        .map(|()| len)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(len) => written += len,
                Err(e) => {
                    token.cancel();
                    for handle in queue {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Raw chunk records for a file, ordered by index.
    pub async fn list_chunks(&self, file_id: &FileId) -> Result<Vec<ChunkRecord>, ChunkerError> {
        Ok(self.metadata.list_chunks(file_id).await?)
    }

    /// Health-probe one randomly chosen backend.
    pub async fn probe_random_backend(&self) -> (usize, String, Result<(), BackendError>) {
        let (index, backend) = self.backends.pick_random();
        (index, backend.describe(), backend.health_check().await)
    }
}

async fn fetch_verified(
    backend: Arc<dyn ChunkBackend>,
    file_id: FileId,
    record: ChunkRecord,
    token: CancellationToken,
) -> Result<Vec<u8>, ChunkerError> {
    let key = ChunkKey::new(file_id, record.chunk_index);
    let capacity = usize::try_from(record.chunk_size).unwrap_or(MAX_PREALLOC).min(MAX_PREALLOC);
    let mut buf = Vec::with_capacity(capacity);
    let digest = transfer::download_chunk(backend.as_ref(), &key, &mut buf, &token)
        .await
        .map_err(|e| ChunkerError::transfer(record.chunk_index, backend.describe(), e))?;
    verify::check_digest(&record, &digest)?;
    Ok(buf)
}

fn flatten(joined: Result<Result<(), ChunkerError>, tokio::task::JoinError>) -> Result<(), ChunkerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ChunkerError::Cancelled),
        Err(e) => Err(ChunkerError::Task(e.to_string())),
    }
}

/// Join every remaining upload task, keeping the first real failure over cancellations.
async fn settle(tasks: &mut JoinSet<Result<(), ChunkerError>>) -> Option<ChunkerError> {
    let mut failure: Option<ChunkerError> = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            failure = match failure {
                None | Some(ChunkerError::Cancelled) => Some(e),
                Some(existing) => Some(existing),
            };
        }
    }
    failure
}
