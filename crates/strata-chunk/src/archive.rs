//! Background archival of sealed chunks
//!
//! ```text
//!  append path                       archiver
//!  ───────────                       ────────
//!  seal ──try_send──▶ [bounded queue] ──▶ dispatcher ──permit──▶ worker
//!         (await when full)                                       │
//!                                     export ─▶ frame ─▶ blob put (retry)
//!                                                                 │
//!                                          upsert snapshot record (LIVE → path)
//! ```
//!
//! A chunk that cannot be archived after retries raises the fatal signal;
//! the owning service watches it and stops ingesting.
//!
//! # Blob format
//!
//! ```text
//! ┌───────────┬───────────┬─────────────┬────────────┬─────────────────┐
//! │ magic u32 │ version   │ payload len │ crc32c u32 │ payload         │
//! │           │ u32       │ u64         │            │ (index export)  │
//! └───────────┴───────────┴─────────────┴────────────┴─────────────────┘
//! ```
//! All integers little-endian.

use crate::blob::BlobStore;
use crate::chunk::{Chunk, ChunkState};
use crate::retry::{RetryPolicy, retry_with_backoff};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{Error, IndexerMetrics, Result, SnapshotRecord};
use strata_meta_store::CoordinationDirectory;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Magic number for archived chunk blobs
const ARCHIVE_MAGIC: u32 = 0x5354_524B; // "STRK"

/// Archive format version
const ARCHIVE_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 + 4;

/// Frame an index export for the blob store.
#[must_use]
pub fn encode_archive(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(ARCHIVE_MAGIC);
    buf.put_u32_le(ARCHIVE_VERSION);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(crc32c::crc32c(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Validate a framed blob and return its payload.
pub fn decode_archive(blob: &[u8]) -> Result<&[u8]> {
    if blob.len() < HEADER_LEN {
        return Err(Error::Serialization(format!(
            "archive too short: {} bytes",
            blob.len()
        )));
    }
    let read_u32 = |at: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&blob[at..at + 4]);
        u32::from_le_bytes(b)
    };
    let magic = read_u32(0);
    if magic != ARCHIVE_MAGIC {
        return Err(Error::Serialization(format!(
            "bad archive magic: {magic:#010x}"
        )));
    }
    let version = read_u32(4);
    if version != ARCHIVE_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported archive version: {version}"
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&blob[8..16]);
    let len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| Error::Serialization("archive length overflow".into()))?;
    let payload = &blob[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Serialization(format!(
            "archive length mismatch: header {len}, actual {}",
            payload.len()
        )));
    }
    let expected = read_u32(16);
    let actual = crc32c::crc32c(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

/// Blob path for a chunk's archive.
#[must_use]
pub fn blob_path(chunk: &Chunk) -> String {
    format!("{}/{}.chunk", chunk.partition_id(), chunk.id())
}

/// Run a coordination directory call on the blocking pool. Directory
/// writes commit a durable transaction and must stay off runtime workers.
pub(crate) async fn on_directory<T, F>(
    directory: &Arc<dyn CoordinationDirectory>,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn CoordinationDirectory) -> Result<T> + Send + 'static,
{
    let directory = Arc::clone(directory);
    tokio::task::spawn_blocking(move || call(directory.as_ref()))
        .await
        .map_err(|e| Error::internal(format!("directory task failed: {e}")))?
}

/// Everything a worker needs to archive one chunk.
#[derive(Clone)]
pub struct ArchiveContext {
    pub blob_store: Arc<dyn BlobStore>,
    pub directory: Arc<dyn CoordinationDirectory>,
    pub metrics: Arc<IndexerMetrics>,
    pub retry: RetryPolicy,
    pub verify_uploads: bool,
}

/// Persist a sealed chunk and publish its snapshot record.
pub async fn archive_chunk(ctx: &ArchiveContext, chunk: &Chunk) -> Result<SnapshotRecord> {
    let data = encode_archive(&chunk.export()?);
    let path = blob_path(chunk);

    let blob_store = ctx.blob_store.as_ref();
    let verify = ctx.verify_uploads;
    let (path_ref, data_ref) = (path.as_str(), &data);
    retry_with_backoff(&ctx.retry, "chunk upload", || async move {
        blob_store.put(path_ref, data_ref.clone()).await?;
        if verify {
            let stored = blob_store.get(path_ref).await?;
            decode_archive(&stored)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::Archival {
        chunk_id: chunk.id().to_string(),
        reason: e.to_string(),
    })?;
    chunk.advance(ChunkState::Archived);

    // Same id as the live marker, so this replaces it.
    let record = chunk.snapshot_record(&path);
    let published = record.clone();
    on_directory(&ctx.directory, move |d| d.put_snapshot(&published)).await?;
    chunk.advance(ChunkState::Published);
    Ok(record)
}

/// Bounded archival queue drained by a fixed-size worker pool.
pub struct Archiver {
    tx: Mutex<Option<mpsc::Sender<Arc<Chunk>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    fatal_rx: watch::Receiver<Option<String>>,
}

impl Archiver {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn spawn(ctx: ArchiveContext, queue_capacity: usize, max_concurrent: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let handle = tokio::spawn(dispatch(rx, ctx, permits, fatal_tx));
        info!(
            "Archiver started (queue capacity {}, {} workers)",
            queue_capacity, max_concurrent
        );
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            fatal_rx,
        }
    }

    /// Queue a sealed chunk. Waits for room when the queue is full.
    pub async fn enqueue(&self, chunk: Arc<Chunk>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::IllegalState("archiver is shut down".into()))?;
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => {
                warn!(
                    "Archive queue full, waiting to enqueue chunk {}",
                    chunk.id()
                );
                tx.send(chunk)
                    .await
                    .map_err(|_| Error::IllegalState("archiver is shut down".into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::IllegalState("archiver is shut down".into()))
            }
        }
    }

    /// Receiver that turns `Some(reason)` when a chunk could not be archived.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_rx.clone()
    }

    /// Close the queue and wait for queued and in-flight chunks.
    /// Returns `false` if the timeout expired first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Archiver dispatcher panicked: {}", e);
                false
            }
            Err(_) => {
                warn!("Archiver did not drain within {:?}", timeout);
                false
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Arc<Chunk>>,
    ctx: ArchiveContext,
    permits: Arc<Semaphore>,
    fatal_tx: watch::Sender<Option<String>>,
) {
    let mut workers = JoinSet::new();
    while let Some(chunk) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        let fatal_tx = fatal_tx.clone();
        workers.spawn(async move {
            let _permit = permit;
            archive_one(&ctx, &chunk, &fatal_tx).await;
        });
        while workers.try_join_next().is_some() {}
    }
    while workers.join_next().await.is_some() {}
    debug!("Archiver dispatcher exited");
}

async fn archive_one(ctx: &ArchiveContext, chunk: &Chunk, fatal_tx: &watch::Sender<Option<String>>) {
    match archive_chunk(ctx, chunk).await {
        Ok(record) => {
            ctx.metrics.rollovers_completed.inc();
            info!(
                "Archived chunk {} to {} (max offset {})",
                record.id, record.path, record.max_offset
            );
        }
        Err(e) => {
            ctx.metrics.rollovers_failed.inc();
            error!("Failed to archive chunk {}: {}", chunk.id(), e);
            fatal_tx.send_replace(Some(e.to_string()));
        }
    }
}
