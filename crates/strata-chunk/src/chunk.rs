//! A chunk: one index store plus the bookkeeping that describes it.
//!
//! ```text
//!   Active ──seal──▶ Sealed ──blob put──▶ Archived ──record published──▶ Published
//! ```
//!
//! Only an Active chunk accepts writes. Every state stays queryable until
//! the chunk is evicted and its index closed.

use crate::index::IndexStore;
use crate::search::{SearchQuery, UnitSearchResult};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use strata_common::{
    ChunkId, Error, INDEX_FORMAT_VERSION, LIVE_SNAPSHOT_PATH, Message, Offset, Result,
    SnapshotRecord,
};
use tracing::debug;

/// Chunk lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChunkState {
    /// Accepting writes
    Active,
    /// Read-only, waiting for archival
    Sealed,
    /// Persisted to the blob store
    Archived,
    /// Snapshot record points at the blob
    Published,
}

/// One unit of accumulation, archival and search.
pub struct Chunk {
    id: ChunkId,
    partition_id: String,
    created_at_ms: i64,
    index: RwLock<Box<dyn IndexStore>>,
    state: Mutex<ChunkState>,
    bytes_indexed: AtomicU64,
    messages_indexed: AtomicU64,
    max_offset: AtomicI64,
    start_time_ms: AtomicI64,
    end_time_ms: AtomicI64,
}

impl Chunk {
    /// Create an active chunk. `base_offset` is the offset consumption resumes
    /// from; until the first write the chunk reports `base_offset - 1` as its
    /// max offset.
    pub fn new(
        id: ChunkId,
        partition_id: impl Into<String>,
        base_offset: Offset,
        index: Box<dyn IndexStore>,
    ) -> Self {
        Self {
            id,
            partition_id: partition_id.into(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            index: RwLock::new(index),
            state: Mutex::new(ChunkState::Active),
            bytes_indexed: AtomicU64::new(0),
            messages_indexed: AtomicU64::new(0),
            max_offset: AtomicI64::new(base_offset - 1),
            start_time_ms: AtomicI64::new(i64::MAX),
            end_time_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub const fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> ChunkState {
        *self.state.lock()
    }

    pub fn bytes_indexed(&self) -> u64 {
        self.bytes_indexed.load(Ordering::Acquire)
    }

    pub fn messages_indexed(&self) -> u64 {
        self.messages_indexed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.messages_indexed() == 0
    }

    pub fn max_offset(&self) -> Offset {
        self.max_offset.load(Ordering::Acquire)
    }

    /// Data time range, or the creation instant while empty.
    pub fn time_range(&self) -> (i64, i64) {
        let start = self.start_time_ms.load(Ordering::Acquire);
        let end = self.end_time_ms.load(Ordering::Acquire);
        if start > end {
            (self.created_at_ms, self.created_at_ms)
        } else {
            (start, end)
        }
    }

    /// Index one message. Fails with a write error if the payload is
    /// rejected, or if the chunk is no longer active.
    pub fn add(&self, message: &Message) -> Result<()> {
        let mut index = self.index.write();
        if self.state() != ChunkState::Active {
            return Err(Error::ChunkSealed {
                chunk_id: self.id.to_string(),
            });
        }
        let timestamp = index.add(&message.payload)?;
        self.bytes_indexed
            .fetch_add(message.size_bytes, Ordering::AcqRel);
        self.messages_indexed.fetch_add(1, Ordering::AcqRel);
        self.max_offset.fetch_max(message.offset, Ordering::AcqRel);
        self.start_time_ms.fetch_min(timestamp, Ordering::AcqRel);
        self.end_time_ms.fetch_max(timestamp, Ordering::AcqRel);
        Ok(())
    }

    /// Stop accepting writes and commit the index.
    pub fn seal(&self) -> Result<()> {
        let mut index = self.index.write();
        {
            let mut state = self.state.lock();
            if *state != ChunkState::Active {
                return Err(Error::IllegalState(format!(
                    "chunk {} is {:?}, cannot seal",
                    self.id, *state
                )));
            }
            *state = ChunkState::Sealed;
        }
        index.commit()?;
        debug!(
            "Sealed chunk {} ({} messages, {} bytes, max offset {})",
            self.id,
            self.messages_indexed(),
            self.bytes_indexed(),
            self.max_offset()
        );
        Ok(())
    }

    /// Advance the state. States never move backwards.
    pub fn advance(&self, to: ChunkState) {
        let mut state = self.state.lock();
        if to > *state {
            *state = to;
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<UnitSearchResult> {
        self.index.read().search(query)
    }

    /// Whether a query over `query`'s time range could hit this chunk.
    pub fn may_match(&self, query: &SearchQuery) -> bool {
        if self.is_empty() {
            return false;
        }
        let (start, end) = self.time_range();
        query.overlaps(start, end)
    }

    pub fn export(&self) -> Result<Vec<u8>> {
        self.index.read().export()
    }

    pub fn close(&self) -> Result<()> {
        self.index.write().close()
    }

    /// Live marker describing this chunk's current contents.
    pub fn live_record(&self) -> SnapshotRecord {
        self.snapshot_record(LIVE_SNAPSHOT_PATH)
    }

    pub fn snapshot_record(&self, path: &str) -> SnapshotRecord {
        let (start_time_ms, end_time_ms) = self.time_range();
        SnapshotRecord {
            id: self.id.to_string(),
            path: path.to_string(),
            start_time_ms,
            end_time_ms,
            max_offset: self.max_offset(),
            partition_id: self.partition_id.clone(),
            index_format_version: INDEX_FORMAT_VERSION,
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("partition_id", &self.partition_id)
            .field("state", &self.state())
            .field("messages", &self.messages_indexed())
            .field("max_offset", &self.max_offset())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TantivyIndex;

    fn message(offset: Offset, ts: i64) -> Message {
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": offset.to_string(),
            "timestamp": ts,
            "message": "hello world"
        }))
        .unwrap();
        Message::new("0", offset, payload, None)
    }

    fn chunk(base_offset: Offset) -> Chunk {
        Chunk::new(ChunkId::new(), "0", base_offset, Box::new(TantivyIndex::new().unwrap()))
    }

    #[test]
    fn test_empty_chunk_reports_base_offset() {
        let c = chunk(100);
        assert_eq!(c.max_offset(), 99);
        assert!(c.is_empty());
        let record = c.live_record();
        assert!(record.is_live());
        assert_eq!(record.max_offset, 99);
        assert_eq!(record.start_time_ms, record.end_time_ms);
    }

    #[test]
    fn test_add_tracks_offsets_and_time() {
        let c = chunk(0);
        c.add(&message(5, 2000)).unwrap();
        c.add(&message(6, 1000)).unwrap();
        assert_eq!(c.messages_indexed(), 2);
        assert_eq!(c.max_offset(), 6);
        assert_eq!(c.time_range(), (1000, 2000));
        assert!(c.bytes_indexed() > 0);
    }

    #[test]
    fn test_failed_write_leaves_counters() {
        let c = chunk(0);
        let bad = Message::new("0", 1, b"{".to_vec(), None);
        assert!(matches!(c.add(&bad), Err(Error::Write(_))));
        assert!(c.is_empty());
        assert_eq!(c.max_offset(), -1);
    }

    #[test]
    fn test_sealed_chunk_rejects_writes_but_searches() {
        let c = chunk(0);
        c.add(&message(1, 10)).unwrap();
        c.seal().unwrap();
        assert_eq!(c.state(), ChunkState::Sealed);
        assert!(matches!(
            c.add(&message(2, 20)),
            Err(Error::ChunkSealed { .. })
        ));
        assert!(c.seal().is_err());

        let q = SearchQuery::new("ds", "hello", 0, 100, 10);
        assert_eq!(c.search(&q).unwrap().total_hits, 1);
    }

    #[test]
    fn test_state_only_advances() {
        let c = chunk(0);
        c.seal().unwrap();
        c.advance(ChunkState::Published);
        c.advance(ChunkState::Archived);
        assert_eq!(c.state(), ChunkState::Published);
    }

    #[test]
    fn test_may_match_skips_empty_and_out_of_range() {
        let c = chunk(0);
        let q = SearchQuery::new("ds", "*", 0, i64::MAX, 10);
        assert!(!c.may_match(&q));
        c.add(&message(1, 500)).unwrap();
        assert!(c.may_match(&q));
        assert!(!c.may_match(&SearchQuery::new("ds", "*", 600, 700, 10)));
    }
}
