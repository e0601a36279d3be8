//! Persistent coordination directory backed by redb.
//!
//! Partition-scoped tables use `"{partition_id}/{id}"` keys so listing a
//! partition is a single range scan inside one read transaction.

use crate::directory::CoordinationDirectory;
use crate::tables;
use redb::{Database, ReadableTable};
use std::path::Path;
use strata_common::{Dataset, RecoveryTaskRecord, SnapshotRecord};
use tracing::info;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error for key '{key}': {source}")]
    Bincode {
        key: String,
        #[source]
        source: bincode::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid partition id '{0}': must not contain '/'")]
    InvalidPartition(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for strata_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Coordination(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// A separator inside the partition id would let one partition's prefix
/// scan pick up another's records.
fn scoped_key(partition_id: &str, id: &str) -> MetaStoreResult<String> {
    if partition_id.contains('/') {
        return Err(MetaStoreError::InvalidPartition(partition_id.to_string()));
    }
    Ok(format!("{partition_id}/{id}"))
}

/// Persistent coordination directory backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::SNAPSHOTS)?;
            let _t = write_txn.open_table(tables::RECOVERY_TASKS)?;
            let _t = write_txn.open_table(tables::DATASETS)?;
        }
        write_txn.commit()?;

        info!("Opened coordination directory at {:?}", path);
        Ok(Self { db })
    }

    // ---- Internal helpers ----

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value).map_err(|source| MetaStoreError::Bincode {
            key: key.to_string(),
            source,
        })?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_key(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Decode every value whose key starts with `prefix`.
    fn load_bincode_prefix<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> MetaStoreResult<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let decoded =
                bincode::deserialize::<T>(value.value()).map_err(|source| {
                    MetaStoreError::Bincode {
                        key: key.to_string(),
                        source,
                    }
                })?;
            result.push(decoded);
        }
        Ok(result)
    }
}

impl CoordinationDirectory for MetaStore {
    fn put_snapshot(&self, record: &SnapshotRecord) -> strata_common::Result<()> {
        let key = scoped_key(&record.partition_id, &record.id)?;
        Ok(self.put_bincode(tables::SNAPSHOTS, &key, record)?)
    }

    fn list_snapshots(&self, partition_id: &str) -> strata_common::Result<Vec<SnapshotRecord>> {
        let prefix = scoped_key(partition_id, "")?;
        Ok(self.load_bincode_prefix(tables::SNAPSHOTS, &prefix)?)
    }

    fn delete_snapshot(&self, partition_id: &str, id: &str) -> strata_common::Result<()> {
        Ok(self.delete_key(tables::SNAPSHOTS, &scoped_key(partition_id, id)?)?)
    }

    fn create_recovery_task(&self, task: &RecoveryTaskRecord) -> strata_common::Result<()> {
        let key = scoped_key(&task.partition_id, &task.name)?;
        Ok(self.put_bincode(tables::RECOVERY_TASKS, &key, task)?)
    }

    fn list_recovery_tasks(
        &self,
        partition_id: &str,
    ) -> strata_common::Result<Vec<RecoveryTaskRecord>> {
        let prefix = scoped_key(partition_id, "")?;
        Ok(self.load_bincode_prefix(tables::RECOVERY_TASKS, &prefix)?)
    }

    fn delete_recovery_task(&self, partition_id: &str, name: &str) -> strata_common::Result<()> {
        Ok(self.delete_key(tables::RECOVERY_TASKS, &scoped_key(partition_id, name)?)?)
    }

    fn put_dataset(&self, dataset: &Dataset) -> strata_common::Result<()> {
        Ok(self.put_bincode(tables::DATASETS, &dataset.name, dataset)?)
    }

    fn list_datasets(&self) -> strata_common::Result<Vec<Dataset>> {
        Ok(self.load_bincode_prefix(tables::DATASETS, "")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{LIVE_SNAPSHOT_PATH, ServiceNamePattern};

    fn snapshot(partition: &str, id: &str, path: &str, max_offset: i64) -> SnapshotRecord {
        SnapshotRecord {
            id: id.to_string(),
            path: path.to_string(),
            start_time_ms: 0,
            end_time_ms: 10,
            max_offset,
            partition_id: partition.to_string(),
            index_format_version: 1,
        }
    }

    #[test]
    fn test_snapshots_scoped_by_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put_snapshot(&snapshot("1", "a", LIVE_SNAPSHOT_PATH, 5)).unwrap();
        store.put_snapshot(&snapshot("1", "b", "blobs/b", 9)).unwrap();
        store.put_snapshot(&snapshot("10", "c", LIVE_SNAPSHOT_PATH, 3)).unwrap();

        let p1 = store.list_snapshots("1").unwrap();
        assert_eq!(p1.len(), 2);
        assert!(p1.iter().all(|s| s.partition_id == "1"));

        let p10 = store.list_snapshots("10").unwrap();
        assert_eq!(p10.len(), 1);
        assert_eq!(p10[0].id, "c");
    }

    #[test]
    fn test_partition_ids_with_separator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put_snapshot(&snapshot("a", "x", "blobs/x", 1)).unwrap();
        assert!(matches!(
            store.put_snapshot(&snapshot("a/b", "y", "blobs/y", 2)),
            Err(strata_common::Error::Coordination(_))
        ));
        assert!(store.list_snapshots("a/b").is_err());
        assert!(store.delete_recovery_task("a/b", "t").is_err());

        let records = store.list_snapshots("a").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "x");
    }

    #[test]
    fn test_put_snapshot_replaces_live_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        store.put_snapshot(&snapshot("0", "a", LIVE_SNAPSHOT_PATH, 5)).unwrap();
        store.put_snapshot(&snapshot("0", "a", "blobs/a", 7)).unwrap();

        let records = store.list_snapshots("0").unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_live());
        assert_eq!(records[0].max_offset, 7);

        store.delete_snapshot("0", "a").unwrap();
        assert!(store.list_snapshots("0").unwrap().is_empty());
    }

    #[test]
    fn test_recovery_tasks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        let task = RecoveryTaskRecord {
            name: "t1".into(),
            partition_id: "0".into(),
            start_offset: 31,
            end_offset: 99,
            created_at_ms: 1,
        };
        store.create_recovery_task(&task).unwrap();
        assert_eq!(store.list_recovery_tasks("0").unwrap(), vec![task]);
        assert!(store.list_recovery_tasks("1").unwrap().is_empty());

        store.delete_recovery_task("0", "t1").unwrap();
        assert!(store.list_recovery_tasks("0").unwrap().is_empty());
    }

    #[test]
    fn test_datasets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let store = MetaStore::open(&path).unwrap();
            store
                .put_dataset(&Dataset {
                    name: "payments".into(),
                    owner: "team".into(),
                    throughput_bytes: 1000,
                    partition_assignments: Vec::new(),
                    service_pattern: ServiceNamePattern::Exact("pay".into()),
                })
                .unwrap();
        }

        let store = MetaStore::open(&path).unwrap();
        let datasets = store.list_datasets().unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(
            datasets[0].service_pattern,
            ServiceNamePattern::Exact("pay".into())
        );
    }
}
