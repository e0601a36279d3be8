//! The coordination directory seen by the indexer.
//!
//! Snapshot and recovery-task records are scoped to a partition; datasets are
//! global. Every list call reads one consistent point in time.

use strata_common::{Dataset, RecoveryTaskRecord, Result, SnapshotRecord};

/// Durable, shared record store for chunk snapshots, recovery tasks and
/// provisioned datasets.
///
/// Any error from an implementation is a coordination failure and is fatal to
/// the partition that hit it.
pub trait CoordinationDirectory: Send + Sync {
    /// Create or replace the snapshot record with the same id.
    fn put_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    fn list_snapshots(&self, partition_id: &str) -> Result<Vec<SnapshotRecord>>;

    fn delete_snapshot(&self, partition_id: &str, id: &str) -> Result<()>;

    fn create_recovery_task(&self, task: &RecoveryTaskRecord) -> Result<()>;

    fn list_recovery_tasks(&self, partition_id: &str) -> Result<Vec<RecoveryTaskRecord>>;

    fn delete_recovery_task(&self, partition_id: &str, name: &str) -> Result<()>;

    fn put_dataset(&self, dataset: &Dataset) -> Result<()>;

    fn list_datasets(&self) -> Result<Vec<Dataset>>;
}
