//! Broker consumer seam
//!
//! The ingestion service reads one partition of a topic through
//! [`BrokerConsumer`]. Two implementations ship with the crate:
//!
//! - [`MemoryBroker`]: an in-process partitioned log, used by tests and
//!   embedded deployments
//! - [`FileLog`]: a newline-delimited file per partition where the line
//!   number is the offset, tailed like a local broker

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_common::{Error, Offset, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A record read from a partition.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub offset: Offset,
    /// Service name the producer keyed the record with, if any.
    pub key: Option<String>,
    pub value: Bytes,
    pub timestamp_ms: i64,
}

/// Consumer bound to a single partition.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Oldest offset still retained.
    async fn earliest_offset(&mut self) -> Result<Offset>;

    /// Offset the next produced record will receive.
    async fn latest_offset(&mut self) -> Result<Offset>;

    /// Position the consumer so the next poll starts at `offset`.
    async fn seek(&mut self, offset: Offset) -> Result<()>;

    /// Fetch up to `max_records`, waiting at most `timeout` for the first.
    ///
    /// Must be cancel safe: the ingestion loop races it against shutdown
    /// and timers, and records read by a dropped poll must come back from
    /// the next one.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`
    base_offset: Offset,
    records: VecDeque<BrokerRecord>,
}

impl PartitionLog {
    fn next_offset(&self) -> Offset {
        self.base_offset + self.records.len() as Offset
    }
}

#[derive(Debug, Default)]
struct MemoryBrokerInner {
    partitions: Mutex<HashMap<String, PartitionLog>>,
    appended: Notify,
    consumers: AtomicUsize,
}

/// In-process partitioned log.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its offset.
    pub fn append(
        &self,
        partition_id: &str,
        key: Option<&str>,
        value: impl Into<Bytes>,
        timestamp_ms: i64,
    ) -> Offset {
        let offset = {
            let mut partitions = self.inner.partitions.lock();
            let log = partitions.entry(partition_id.to_string()).or_default();
            let offset = log.next_offset();
            log.records.push_back(BrokerRecord {
                offset,
                key: key.map(str::to_string),
                value: value.into(),
                timestamp_ms,
            });
            offset
        };
        self.inner.appended.notify_waiters();
        offset
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, partition_id: &str, offset: Offset) {
        let mut partitions = self.inner.partitions.lock();
        let log = partitions.entry(partition_id.to_string()).or_default();
        while log.base_offset < offset && !log.records.is_empty() {
            log.records.pop_front();
            log.base_offset += 1;
        }
        if log.records.is_empty() && log.base_offset < offset {
            log.base_offset = offset;
        }
    }

    pub fn consumer(&self, partition_id: &str) -> MemoryConsumer {
        self.inner.consumers.fetch_add(1, Ordering::SeqCst);
        MemoryConsumer {
            inner: Arc::clone(&self.inner),
            partition_id: partition_id.to_string(),
            position: 0,
            closed: false,
        }
    }

    /// Consumers created and not yet closed.
    pub fn connected_consumers(&self) -> usize {
        self.inner.consumers.load(Ordering::SeqCst)
    }
}

fn bounds(inner: &MemoryBrokerInner, partition_id: &str) -> (Offset, Offset) {
    inner
        .partitions
        .lock()
        .get(partition_id)
        .map_or((0, 0), |log| (log.base_offset, log.next_offset()))
}

/// Consumer over a [`MemoryBroker`] partition.
#[derive(Debug)]
pub struct MemoryConsumer {
    inner: Arc<MemoryBrokerInner>,
    partition_id: String,
    position: Offset,
    closed: bool,
}

impl MemoryConsumer {
    fn take(&mut self, max_records: usize) -> Vec<BrokerRecord> {
        let partitions = self.inner.partitions.lock();
        let Some(log) = partitions.get(&self.partition_id) else {
            return Vec::new();
        };
        // Records below the retained range are gone; resume at the head.
        let start = self.position.max(log.base_offset);
        let skip = usize::try_from(start - log.base_offset).unwrap_or(usize::MAX);
        let records: Vec<_> = log
            .records
            .iter()
            .skip(skip)
            .take(max_records)
            .cloned()
            .collect();
        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        records
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::broker("consumer is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn earliest_offset(&mut self) -> Result<Offset> {
        self.ensure_open()?;
        Ok(bounds(&self.inner, &self.partition_id).0)
    }

    async fn latest_offset(&mut self) -> Result<Offset> {
        self.ensure_open()?;
        Ok(bounds(&self.inner, &self.partition_id).1)
    }

    async fn seek(&mut self, offset: Offset) -> Result<()> {
        self.ensure_open()?;
        self.position = offset;
        Ok(())
    }

    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            let inner = Arc::clone(&self.inner);
            let appended = inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let records = self.take(max_records);
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.consumers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.inner.consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Interval between tail reads when a file log has no new lines.
const TAIL_INTERVAL: Duration = Duration::from_millis(20);

/// Newline-delimited partition log at `<dir>/<topic>-<partition>.log`.
///
/// Line `n` holds the record at offset `n`. Each line is the record value;
/// records carry no key, so the service name comes from the payload.
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn new(log_dir: &Path, topic: &str, partition_id: &str) -> Self {
        Self {
            path: log_dir.join(format!("{topic}-{partition_id}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn consumer(&self) -> FileLogConsumer {
        FileLogConsumer {
            path: self.path.clone(),
            reader: None,
            next_offset: 0,
            partial: Vec::new(),
            ready: VecDeque::new(),
        }
    }
}

/// Tailing consumer over a [`FileLog`].
///
/// Read progress lives in the consumer, not in the poll future, so a poll
/// dropped at an await point loses nothing: the next poll returns what the
/// dropped one had already read.
#[derive(Debug)]
pub struct FileLogConsumer {
    path: PathBuf,
    reader: Option<BufReader<tokio::fs::File>>,
    /// Offset the next line read from the file will carry.
    next_offset: Offset,
    /// Bytes of a trailing line not yet terminated by a newline.
    partial: Vec<u8>,
    /// Records read from the file but not yet returned by a poll.
    ready: VecDeque<BrokerRecord>,
}

impl FileLogConsumer {
    /// Open the file if needed. `false` while it does not exist yet.
    async fn open(&mut self) -> Result<bool> {
        if self.reader.is_none() {
            match tokio::fs::File::open(&self.path).await {
                Ok(file) => {
                    self.reader = Some(BufReader::new(file));
                    self.next_offset = 0;
                    self.partial.clear();
                    self.ready.clear();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Read the next complete line, or `None` at the current end of file.
    ///
    /// Bytes leave the reader only after `fill_buf` resolves and are moved
    /// into `partial` before the next await.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.open().await? {
            return Ok(None);
        }
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            if let Some(end) = available.iter().position(|b| *b == b'\n') {
                self.partial.extend_from_slice(&available[..end]);
                reader.consume(end + 1);
                let mut line = std::mem::take(&mut self.partial);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }
            let len = available.len();
            self.partial.extend_from_slice(available);
            reader.consume(len);
        }
    }

    async fn count_lines(&self) -> Result<Offset> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(data.iter().filter(|b| **b == b'\n').count() as Offset),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BrokerConsumer for FileLogConsumer {
    async fn earliest_offset(&mut self) -> Result<Offset> {
        Ok(0)
    }

    async fn latest_offset(&mut self) -> Result<Offset> {
        self.count_lines().await
    }

    async fn seek(&mut self, offset: Offset) -> Result<()> {
        if offset < 0 {
            return Err(Error::broker(format!("cannot seek to offset {offset}")));
        }
        self.ready.clear();
        if offset < self.next_offset {
            self.reader = None;
        }
        self.open().await?;
        while self.next_offset < offset {
            if self.next_line().await?.is_none() {
                return Err(Error::broker(format!(
                    "offset {offset} is beyond the end of {}",
                    self.path.display()
                )));
            }
            self.next_offset += 1;
        }
        debug!("Seeked {} to offset {}", self.path.display(), offset);
        Ok(())
    }

    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            while self.ready.len() < max_records {
                let Some(line) = self.next_line().await? else {
                    break;
                };
                self.ready.push_back(BrokerRecord {
                    offset: self.next_offset,
                    key: None,
                    value: Bytes::from(line),
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                });
                self.next_offset += 1;
            }
            if !self.ready.is_empty() || Instant::now() >= deadline {
                let count = self.ready.len().min(max_records);
                return Ok(self.ready.drain(..count).collect());
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + TAIL_INTERVAL)).await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.partial.clear();
        self.ready.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_memory_broker_offsets_and_poll() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            assert_eq!(broker.append("0", Some("api"), format!("m{i}"), i), i);
        }
        broker.append("1", None, "other", 0);

        let mut consumer = broker.consumer("0");
        assert_eq!(consumer.earliest_offset().await.unwrap(), 0);
        assert_eq!(consumer.latest_offset().await.unwrap(), 5);

        consumer.seek(2).await.unwrap();
        let records = consumer.poll(2, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(records[0].key.as_deref(), Some("api"));

        let rest = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(consumer.poll(10, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_broker_retention() {
        let broker = MemoryBroker::new();
        for i in 0..10 {
            broker.append("0", None, "x", i);
        }
        broker.truncate_before("0", 7);
        broker.truncate_before("empty", 3);

        let mut consumer = broker.consumer("0");
        assert_eq!(consumer.earliest_offset().await.unwrap(), 7);
        assert_eq!(consumer.latest_offset().await.unwrap(), 10);
        assert_eq!(bounds(&broker.inner, "empty"), (3, 3));

        consumer.seek(2).await.unwrap();
        let records = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.first().map(|r| r.offset), Some(7));
    }

    #[tokio::test]
    async fn test_memory_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("0");

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append("0", None, "late", 0);
        });

        let records = consumer.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_consumer_close_tracked() {
        let broker = MemoryBroker::new();
        let mut a = broker.consumer("0");
        let b = broker.consumer("0");
        assert_eq!(broker.connected_consumers(), 2);

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.poll(1, Duration::ZERO).await.is_err());
        drop(b);
        assert_eq!(broker.connected_consumers(), 0);
    }

    #[tokio::test]
    async fn test_file_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path(), "logs", "0");
        let mut consumer = log.consumer();

        assert_eq!(consumer.latest_offset().await.unwrap(), 0);
        assert!(consumer.poll(10, Duration::from_millis(30)).await.unwrap().is_empty());

        let mut file = tokio::fs::File::create(log.path()).await.unwrap();
        file.write_all(b"zero\none\ntwo\nparti").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(consumer.latest_offset().await.unwrap(), 3);
        consumer.seek(1).await.unwrap();
        let records = consumer.poll(10, Duration::from_millis(30)).await.unwrap();
        let values: Vec<_> = records.iter().map(|r| (r.offset, r.value.clone())).collect();
        assert_eq!(
            values,
            vec![(1, Bytes::from("one")), (2, Bytes::from("two"))]
        );

        file.write_all(b"al\n").await.unwrap();
        file.flush().await.unwrap();
        let records = consumer.poll(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 3);
        assert_eq!(records[0].value, Bytes::from("partial"));
    }

    #[tokio::test]
    async fn test_file_log_poll_survives_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path(), "logs", "0");
        let lines: String = (0..5000).map(|i| format!("line-{i}\n")).collect();
        tokio::fs::write(log.path(), lines).await.unwrap();

        let mut consumer = log.consumer();
        let mut offsets = Vec::new();
        for round in 0..100_000 {
            if offsets.len() == 5000 {
                break;
            }
            // Every other poll is dropped as soon as it has to wait
            let polled = if round % 2 == 0 {
                tokio::time::timeout(Duration::ZERO, consumer.poll(64, Duration::from_millis(10)))
                    .await
                    .ok()
            } else {
                Some(consumer.poll(64, Duration::from_millis(10)).await)
            };
            if let Some(records) = polled {
                offsets.extend(records.unwrap().into_iter().map(|r| r.offset));
            }
        }
        assert_eq!(offsets, (0..5000).collect::<Vec<Offset>>());
    }

    #[tokio::test]
    async fn test_file_log_seek_discards_buffered_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path(), "logs", "0");
        tokio::fs::write(log.path(), b"a\nb\nc\nd\n").await.unwrap();

        let mut consumer = log.consumer();
        let first = consumer.poll(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first[0].offset, 0);

        consumer.seek(1).await.unwrap();
        let records = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert_eq!(records[0].value, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_file_log_seek_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(dir.path(), "logs", "0");
        tokio::fs::write(log.path(), b"a\nb\n").await.unwrap();

        let mut consumer = log.consumer();
        consumer.seek(2).await.unwrap();
        assert!(matches!(consumer.seek(5).await, Err(Error::Broker(_))));
    }
}
