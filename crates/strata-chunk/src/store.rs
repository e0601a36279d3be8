//! Chunk store: the active chunk, resident sealed chunks, and the rollover
//! path between them.
//!
//! Exactly one chunk is active at a time. Rollover swaps it under the chunk
//! list's write lock; that swap is the only point queries synchronize with.

use crate::archive::{ArchiveContext, Archiver, on_directory};
use crate::blob::BlobStore;
use crate::chunk::{Chunk, ChunkState};
use crate::index::IndexFactory;
use crate::retry::RetryPolicy;
use crate::rollover::RolloverPolicy;
use crate::search::{SearchQuery, SearchResult, SearchResultAggregator};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use strata_common::config::{ArchiveConfig, IndexerConfig};
use strata_common::{ChunkId, Error, IndexerMetrics, Message, Offset, Result};
use strata_meta_store::CoordinationDirectory;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Chunk store configuration
#[derive(Debug, Clone)]
pub struct ChunkStoreConfig {
    pub max_bytes_per_chunk: u64,
    pub max_messages_per_chunk: u64,
    pub live_marker_refresh_messages: u64,
    pub max_resident_sealed_chunks: usize,
    pub archive_queue_capacity: usize,
    pub max_concurrent_archives: usize,
    pub verify_uploads: bool,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self::from_config(&IndexerConfig::default(), &ArchiveConfig::default())
    }
}

impl ChunkStoreConfig {
    #[must_use]
    pub fn from_config(indexer: &IndexerConfig, archive: &ArchiveConfig) -> Self {
        Self {
            max_bytes_per_chunk: indexer.max_bytes_per_chunk,
            max_messages_per_chunk: indexer.max_messages_per_chunk,
            live_marker_refresh_messages: indexer.live_marker_refresh_messages,
            max_resident_sealed_chunks: indexer.max_resident_sealed_chunks,
            archive_queue_capacity: archive.queue_capacity,
            max_concurrent_archives: archive.max_concurrent,
            verify_uploads: archive.verify_uploads,
            retry: RetryPolicy::from(&archive.retry),
            shutdown_timeout: archive.shutdown_timeout(),
        }
    }
}

struct ChunkList {
    active: Arc<Chunk>,
    /// Oldest first
    sealed: VecDeque<Arc<Chunk>>,
}

/// Manages the chunks of one partition.
pub struct ChunkStore {
    partition_id: String,
    config: ChunkStoreConfig,
    policy: RolloverPolicy,
    directory: Arc<dyn CoordinationDirectory>,
    index_factory: Arc<dyn IndexFactory>,
    metrics: Arc<IndexerMetrics>,
    chunks: RwLock<ChunkList>,
    archiver: Archiver,
    since_marker_refresh: AtomicU64,
    closed: AtomicBool,
}

impl ChunkStore {
    /// Open the store with an empty active chunk whose live marker records
    /// `start_offset - 1`. Must be called inside a tokio runtime.
    pub fn open(
        partition_id: impl Into<String>,
        config: ChunkStoreConfig,
        start_offset: Offset,
        directory: Arc<dyn CoordinationDirectory>,
        blob_store: Arc<dyn BlobStore>,
        index_factory: Arc<dyn IndexFactory>,
        metrics: Arc<IndexerMetrics>,
    ) -> Result<Self> {
        let partition_id = partition_id.into();
        let policy = RolloverPolicy::new(config.max_bytes_per_chunk, config.max_messages_per_chunk)?;
        if config.live_marker_refresh_messages == 0 {
            return Err(Error::invalid_config(
                "live marker refresh interval must be positive",
            ));
        }

        let first = new_chunk(&partition_id, start_offset, index_factory.as_ref())?;
        directory.put_snapshot(&first.live_record())?;
        let archiver = Archiver::spawn(
            ArchiveContext {
                blob_store,
                directory: Arc::clone(&directory),
                metrics: Arc::clone(&metrics),
                retry: config.retry.clone(),
                verify_uploads: config.verify_uploads,
            },
            config.archive_queue_capacity,
            config.max_concurrent_archives,
        );

        info!(
            "Opened chunk store for partition {} at offset {} (active chunk {})",
            partition_id,
            start_offset,
            first.id()
        );
        Ok(Self {
            partition_id,
            config,
            policy,
            directory,
            index_factory,
            metrics,
            chunks: RwLock::new(ChunkList {
                active: first,
                sealed: VecDeque::new(),
            }),
            archiver,
            since_marker_refresh: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn active_chunk(&self) -> Arc<Chunk> {
        Arc::clone(&self.chunks.read().active)
    }

    /// Resident chunks, sealed oldest first, active last.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let list = self.chunks.read();
        list.sealed
            .iter()
            .chain(std::iter::once(&list.active))
            .cloned()
            .collect()
    }

    /// Turns `Some(reason)` once a sealed chunk could not be archived.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.archiver.fatal_signal()
    }

    /// Index one message into the active chunk, rolling over if a threshold
    /// is reached.
    ///
    /// A rejected payload is counted and returned as a write error; the
    /// caller may continue with the next message. Coordination and archival
    /// errors are fatal.
    pub async fn append(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::IllegalState("chunk store is closed".into()));
        }
        self.metrics.messages_received.inc();
        if message.partition_id != self.partition_id {
            self.metrics.messages_failed.inc();
            return Err(Error::write(format!(
                "message for partition {} sent to partition {}",
                message.partition_id, self.partition_id
            )));
        }

        let active = self.active_chunk();
        if let Err(e) = active.add(message) {
            self.metrics.messages_failed.inc();
            return Err(e);
        }

        let since = self.since_marker_refresh.fetch_add(1, Ordering::AcqRel) + 1;
        if since >= self.config.live_marker_refresh_messages {
            self.since_marker_refresh.store(0, Ordering::Release);
            self.publish_marker(&active).await?;
            debug!(
                "Refreshed live marker for chunk {} at offset {}",
                active.id(),
                active.max_offset()
            );
        }

        if self
            .policy
            .should_roll_over(active.bytes_indexed(), active.messages_indexed())
        {
            self.roll_over(active).await?;
        }
        Ok(())
    }

    async fn roll_over(&self, current: Arc<Chunk>) -> Result<()> {
        self.metrics.rollovers_initiated.inc();
        if let Err(e) = current.seal() {
            self.metrics.rollovers_failed.inc();
            return Err(e);
        }
        // The sealed chunk's marker must cover everything it holds until the
        // archived record replaces it.
        self.publish_marker(&current).await?;

        let next = new_chunk(
            &self.partition_id,
            current.max_offset() + 1,
            self.index_factory.as_ref(),
        )?;
        self.publish_marker(&next).await?;
        {
            let mut list = self.chunks.write();
            list.sealed.push_back(Arc::clone(&current));
            list.active = Arc::clone(&next);
            self.evict_published(&mut list);
        }
        self.since_marker_refresh.store(0, Ordering::Release);

        info!(
            "Rolled over chunk {} ({} messages, {} bytes, max offset {}), new active chunk {}",
            current.id(),
            current.messages_indexed(),
            current.bytes_indexed(),
            current.max_offset(),
            next.id()
        );
        self.archiver.enqueue(current).await
    }

    async fn publish_marker(&self, chunk: &Chunk) -> Result<()> {
        let marker = chunk.live_record();
        on_directory(&self.directory, move |d| d.put_snapshot(&marker)).await
    }

    /// Drop the oldest published chunks beyond the residency bound.
    fn evict_published(&self, list: &mut ChunkList) {
        while list.sealed.len() > self.config.max_resident_sealed_chunks {
            let Some(pos) = list
                .sealed
                .iter()
                .position(|c| c.state() == ChunkState::Published)
            else {
                break;
            };
            if let Some(evicted) = list.sealed.remove(pos) {
                debug!("Evicted published chunk {} from memory", evicted.id());
            }
        }
    }

    /// Search every resident chunk that may hold matches.
    ///
    /// Chunks that fail or miss the deadline are reported in
    /// `failed_nodes`; the rest still contribute.
    pub async fn query(&self, query: &SearchQuery, timeout: Duration) -> SearchResult {
        let started = Instant::now();
        let units: Vec<Arc<Chunk>> = self
            .chunks()
            .into_iter()
            .filter(|c| c.may_match(query))
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::new(query.clone());
        let handles: Vec<_> = units
            .into_iter()
            .map(|chunk| {
                let q = Arc::clone(&shared);
                let id = *chunk.id();
                (id, tokio::task::spawn_blocking(move || chunk.search(&q)))
            })
            .collect();

        let mut aggregator = SearchResultAggregator::new(query.limit);
        for (id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(unit))) => aggregator.add(unit),
                Ok(Ok(Err(e))) => {
                    warn!("Search of chunk {} failed: {}", id, e);
                    aggregator.add_failure();
                }
                Ok(Err(e)) => {
                    warn!("Search task for chunk {} aborted: {}", id, e);
                    aggregator.add_failure();
                }
                Err(_) => {
                    warn!("Search of chunk {} missed the {:?} deadline", id, timeout);
                    aggregator.add_failure();
                }
            }
        }
        aggregator.finish(started.elapsed())
    }

    /// Seal and archive the active chunk, then drain the archiver.
    /// Idempotent; only the first call does any work.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let active = self.active_chunk();
        let result = if active.is_empty() {
            let (partition_id, id) = (self.partition_id.clone(), active.id().to_string());
            on_directory(&self.directory, move |d| d.delete_snapshot(&partition_id, &id)).await
        } else {
            self.seal_for_shutdown(&active).await
        };
        if let Err(e) = &result {
            warn!(
                "Failed to hand off active chunk {} at shutdown: {}",
                active.id(),
                e
            );
        }

        if self.archiver.shutdown(self.config.shutdown_timeout).await {
            for chunk in self.chunks() {
                if let Err(e) = chunk.close() {
                    warn!("Failed to close chunk {}: {}", chunk.id(), e);
                }
            }
        }
        info!("Closed chunk store for partition {}", self.partition_id);
        result
    }

    async fn seal_for_shutdown(&self, active: &Arc<Chunk>) -> Result<()> {
        self.metrics.rollovers_initiated.inc();
        if let Err(e) = active.seal() {
            self.metrics.rollovers_failed.inc();
            return Err(e);
        }
        self.publish_marker(active).await?;
        self.archiver.enqueue(Arc::clone(active)).await
    }
}

/// Allocate a fresh active chunk. The caller publishes its live marker.
fn new_chunk(
    partition_id: &str,
    base_offset: Offset,
    index_factory: &dyn IndexFactory,
) -> Result<Arc<Chunk>> {
    let id = ChunkId::new();
    let index = index_factory.create(&id)?;
    Ok(Arc::new(Chunk::new(id, partition_id, base_offset, index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::index::{IndexStore, TantivyIndex, TantivyIndexFactory};
    use crate::search::UnitSearchResult;
    use std::sync::atomic::AtomicUsize;
    use strata_common::{Dataset, RecoveryTaskRecord, SnapshotRecord};
    use strata_meta_store::MetaStore;

    /// Directory whose snapshot writes block the calling thread.
    struct SlowDirectory {
        inner: Arc<MetaStore>,
        delay: Duration,
    }

    impl CoordinationDirectory for SlowDirectory {
        fn put_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.put_snapshot(record)
        }

        fn list_snapshots(&self, partition_id: &str) -> Result<Vec<SnapshotRecord>> {
            self.inner.list_snapshots(partition_id)
        }

        fn delete_snapshot(&self, partition_id: &str, id: &str) -> Result<()> {
            self.inner.delete_snapshot(partition_id, id)
        }

        fn create_recovery_task(&self, task: &RecoveryTaskRecord) -> Result<()> {
            self.inner.create_recovery_task(task)
        }

        fn list_recovery_tasks(&self, partition_id: &str) -> Result<Vec<RecoveryTaskRecord>> {
            self.inner.list_recovery_tasks(partition_id)
        }

        fn delete_recovery_task(&self, partition_id: &str, name: &str) -> Result<()> {
            self.inner.delete_recovery_task(partition_id, name)
        }

        fn put_dataset(&self, dataset: &Dataset) -> Result<()> {
            self.inner.put_dataset(dataset)
        }

        fn list_datasets(&self) -> Result<Vec<Dataset>> {
            self.inner.list_datasets()
        }
    }

    /// Index whose searches finish `delay` after computing their result.
    struct SlowIndex {
        inner: TantivyIndex,
        delay: Duration,
        searching: Arc<AtomicBool>,
    }

    impl IndexStore for SlowIndex {
        fn add(&mut self, payload: &[u8]) -> Result<i64> {
            self.inner.add(payload)
        }

        fn search(&self, query: &SearchQuery) -> Result<UnitSearchResult> {
            let result = self.inner.search(query);
            self.searching.store(true, Ordering::Release);
            std::thread::sleep(self.delay);
            result
        }

        fn commit(&mut self) -> Result<()> {
            self.inner.commit()
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }

        fn export(&self) -> Result<Vec<u8>> {
            self.inner.export()
        }

        fn doc_count(&self) -> u64 {
            self.inner.doc_count()
        }
    }

    /// Only the first index it creates is slow.
    struct SlowIndexFactory {
        delay: Duration,
        created: AtomicUsize,
        searching: Arc<AtomicBool>,
    }

    impl SlowIndexFactory {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                created: AtomicUsize::new(0),
                searching: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl IndexFactory for SlowIndexFactory {
        fn create(&self, _chunk_id: &ChunkId) -> Result<Box<dyn IndexStore>> {
            let delay = if self.created.fetch_add(1, Ordering::AcqRel) == 0 {
                self.delay
            } else {
                Duration::ZERO
            };
            Ok(Box::new(SlowIndex {
                inner: TantivyIndex::new()?,
                delay,
                searching: Arc::clone(&self.searching),
            }))
        }
    }

    fn open_store(
        dir: &tempfile::TempDir,
        config: ChunkStoreConfig,
        directory: Arc<dyn CoordinationDirectory>,
        index_factory: Arc<dyn IndexFactory>,
    ) -> ChunkStore {
        ChunkStore::open(
            "0",
            config,
            0,
            directory,
            Arc::new(FsBlobStore::new(dir.path().join("blobs"))),
            index_factory,
            Arc::new(IndexerMetrics::new()),
        )
        .unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        directory: Arc<MetaStore>,
        metrics: Arc<IndexerMetrics>,
        store: ChunkStore,
    }

    fn config(max_messages: u64) -> ChunkStoreConfig {
        ChunkStoreConfig {
            max_messages_per_chunk: max_messages,
            live_marker_refresh_messages: 2,
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                backoff_multiplier: 1.0,
            },
            ..ChunkStoreConfig::default()
        }
    }

    fn fixture(config: ChunkStoreConfig, start_offset: Offset) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let metrics = Arc::new(IndexerMetrics::new());
        let store = ChunkStore::open(
            "0",
            config,
            start_offset,
            directory.clone(),
            Arc::new(FsBlobStore::new(dir.path().join("blobs"))),
            Arc::new(TantivyIndexFactory),
            metrics.clone(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            directory,
            metrics,
            store,
        }
    }

    fn message(offset: Offset, text: &str) -> Message {
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": format!("m{offset}"),
            "timestamp": 1_000 + offset,
            "service_name": "api",
            "message": text,
        }))
        .unwrap();
        Message::new("0", offset, payload, Some("api".into()))
    }

    async fn wait_for_published(chunk: &Chunk) {
        for _ in 0..500 {
            if chunk.state() == ChunkState::Published {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("chunk {} never published", chunk.id());
    }

    #[tokio::test]
    async fn test_open_publishes_live_marker() {
        let f = fixture(config(10), 42);
        let records = f.directory.list_snapshots("0").unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_live());
        assert_eq!(records[0].max_offset, 41);
    }

    #[tokio::test]
    async fn test_rejects_zero_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let result = ChunkStore::open(
            "0",
            ChunkStoreConfig {
                max_bytes_per_chunk: 0,
                ..ChunkStoreConfig::default()
            },
            0,
            directory,
            Arc::new(FsBlobStore::new(dir.path().join("blobs"))),
            Arc::new(TantivyIndexFactory),
            Arc::new(IndexerMetrics::new()),
        );
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_rollover_swaps_active_and_archives() {
        let f = fixture(config(3), 0);
        let first = f.store.active_chunk();

        for offset in 0..3 {
            f.store.append(&message(offset, "payment accepted")).await.unwrap();
        }

        let second = f.store.active_chunk();
        assert_ne!(first.id(), second.id());
        assert!(second.is_empty());
        assert_eq!(second.max_offset(), 2);
        assert_eq!(f.metrics.rollovers_initiated.get(), 1);

        wait_for_published(&first).await;
        assert_eq!(f.metrics.rollovers_completed.get(), 1);

        let records = f.directory.list_snapshots("0").unwrap();
        let persisted: Vec<_> = records.iter().filter(|r| !r.is_live()).collect();
        let live: Vec<_> = records.iter().filter(|r| r.is_live()).collect();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].max_offset, 2);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id().to_string());

        // The sealed chunk is still searchable
        let q = SearchQuery::new("ds", "payment", 0, i64::MAX, 10);
        let result = f.store.query(&q, Duration::from_secs(3)).await;
        assert_eq!(result.total_hits, 3);
        assert_eq!(result.total_nodes, 1);
    }

    #[tokio::test]
    async fn test_bad_payload_counted_and_skipped() {
        let f = fixture(config(10), 0);
        let bad = Message::new("0", 0, b"garbage".to_vec(), None);
        assert!(matches!(f.store.append(&bad).await, Err(Error::Write(_))));
        f.store.append(&message(1, "ok")).await.unwrap();

        assert_eq!(f.metrics.messages_received.get(), 2);
        assert_eq!(f.metrics.messages_failed.get(), 1);
        assert_eq!(f.store.active_chunk().messages_indexed(), 1);
    }

    #[tokio::test]
    async fn test_live_marker_refreshes_on_cadence() {
        let f = fixture(config(100), 0);
        f.store.append(&message(0, "a")).await.unwrap();
        f.store.append(&message(1, "b")).await.unwrap();

        let records = f.directory.list_snapshots("0").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].max_offset, 1);
    }

    #[tokio::test]
    async fn test_query_single_archived_unit() {
        let f = fixture(config(1), 0);
        f.store.append(&message(0, "needle")).await.unwrap();
        let archived = f.store.chunks()[0].clone();
        wait_for_published(&archived).await;

        let q = SearchQuery::new("ds", "needle", 0, i64::MAX, 100);
        let result = f.store.query(&q, Duration::from_secs(3)).await;
        assert_eq!(result.hits.len(), 1);
        assert!(result.took_micros > 0);
        assert_eq!(result.failed_nodes, 0);
        assert_eq!(result.total_nodes, 1);
        assert_eq!(result.total_snapshots, 1);
        assert_eq!(result.snapshots_with_replicas, 1);
    }

    #[tokio::test]
    async fn test_evicts_only_published_chunks() {
        let mut cfg = config(1);
        cfg.max_resident_sealed_chunks = 1;
        let f = fixture(cfg, 0);

        f.store.append(&message(0, "one")).await.unwrap();
        wait_for_published(&f.store.chunks()[0]).await;
        f.store.append(&message(1, "two")).await.unwrap();

        let chunks = f.store.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].max_offset(), 1);
    }

    #[tokio::test]
    async fn test_close_archives_active_once() {
        let f = fixture(config(100), 0);
        f.store.append(&message(0, "last words")).await.unwrap();
        let active = f.store.active_chunk();

        f.store.close().await.unwrap();
        f.store.close().await.unwrap();

        assert_eq!(f.metrics.rollovers_initiated.get(), 1);
        assert_eq!(f.metrics.rollovers_completed.get(), 1);
        assert_eq!(active.state(), ChunkState::Published);
        assert!(f.store.append(&message(1, "late")).await.is_err());

        let records = f.directory.list_snapshots("0").unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_live());
    }

    #[tokio::test]
    async fn test_close_removes_empty_live_marker() {
        let f = fixture(config(100), 0);
        f.store.close().await.unwrap();
        assert!(f.directory.list_snapshots("0").unwrap().is_empty());
        assert_eq!(f.metrics.rollovers_initiated.get(), 0);
    }

    #[tokio::test]
    async fn test_query_reports_unit_past_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let factory = Arc::new(SlowIndexFactory::new(Duration::from_millis(500)));
        let store = open_store(&dir, config(100), directory, factory);
        store.append(&message(0, "slow needle")).await.unwrap();

        let q = SearchQuery::new("ds", "needle", 0, i64::MAX, 10);
        let started = Instant::now();
        let result = store.query(&q, Duration::from_millis(50)).await;

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(result.total_nodes, 1);
        assert_eq!(result.failed_nodes, 1);
        assert_eq!(result.snapshots_with_replicas, 0);
        assert!(result.hits.is_empty());
        assert_eq!(result.total_hits, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_keeps_units_it_started_with_across_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let factory = Arc::new(SlowIndexFactory::new(Duration::from_millis(300)));
        let searching = Arc::clone(&factory.searching);
        let store = Arc::new(open_store(&dir, config(1), directory, factory));

        store.append(&message(0, "needle zero")).await.unwrap();
        let q = SearchQuery::new("ds", "needle", 0, i64::MAX, 10);
        let in_flight = {
            let store = Arc::clone(&store);
            let q = q.clone();
            tokio::spawn(async move { store.query(&q, Duration::from_secs(3)).await })
        };

        while !searching.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        store.append(&message(1, "needle one")).await.unwrap();
        store.append(&message(2, "needle two")).await.unwrap();

        let first = in_flight.await.unwrap();
        assert_eq!(first.total_nodes, 1);
        assert_eq!(first.failed_nodes, 0);
        assert_eq!(first.total_hits, 1);

        let fresh = store.query(&q, Duration::from_secs(3)).await;
        assert_eq!(fresh.total_nodes, 3);
        assert_eq!(fresh.failed_nodes, 0);
        assert_eq!(fresh.total_hits, 3);
    }

    #[tokio::test]
    async fn test_directory_writes_leave_runtime_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(SlowDirectory {
            inner: Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap()),
            delay: Duration::from_millis(100),
        });
        let store = open_store(&dir, config(1), directory, Arc::new(TantivyIndexFactory));

        let ticks = Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        // Rolls over: two marker writes on the append path
        store.append(&message(0, "tick")).await.unwrap();
        let observed = ticks.load(Ordering::Relaxed);
        ticker.abort();

        assert!(observed >= 5, "runtime stalled: only {observed} ticks");
        assert_eq!(store.chunks().len(), 2);
    }
}
