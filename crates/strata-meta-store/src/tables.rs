//! Redb table definitions for the coordination directory.

use redb::TableDefinition;

// Key: "{partition_id}/{snapshot_id}", Value: bincode-encoded SnapshotRecord
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
// Key: "{partition_id}/{task_name}", Value: bincode-encoded RecoveryTaskRecord
pub const RECOVERY_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("recovery_tasks");
// Key: dataset name, Value: bincode-encoded Dataset
pub const DATASETS: TableDefinition<&str, &[u8]> = TableDefinition::new("datasets");
