//! Startup recovery for one partition
//!
//! A crash leaves live markers behind for chunks that were never archived.
//! Their offsets have to be re-indexed by an offline recovery task, and live
//! consumption resumes right after them. [`compute_plan`] makes that decision
//! from the directory contents; [`RecoveryPlanner`] applies it.

use std::sync::Arc;
use strata_common::{Error, Offset, RecoveryTaskRecord, Result, SnapshotRecord};
use strata_meta_store::CoordinationDirectory;
use tracing::{info, warn};

/// Inclusive offset range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    pub start: Offset,
    pub end: Offset,
}

impl OffsetRange {
    #[must_use]
    pub const fn len(&self) -> Offset {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// What startup recovery decided for a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// First offset live consumption reads.
    pub resume_offset: Offset,
    /// Ranges that need a new recovery task. Already-covered ranges are
    /// excluded.
    pub new_tasks: Vec<OffsetRange>,
    /// Ids of this partition's live markers to delete.
    pub stale_live_markers: Vec<String>,
}

/// Decide where to resume and what to hand to recovery.
///
/// `latest` is the offset the next produced record will receive.
#[must_use]
pub fn compute_plan(
    snapshots: &[SnapshotRecord],
    existing_tasks: &[RecoveryTaskRecord],
    earliest: Offset,
    latest: Offset,
    max_offset_delay: Option<u64>,
) -> RecoveryPlan {
    let (live, persisted): (Vec<_>, Vec<_>) = snapshots.iter().partition(|s| s.is_live());

    let persisted_resume = persisted
        .iter()
        .map(|s| s.max_offset + 1)
        .max()
        .unwrap_or(earliest)
        .max(earliest);

    let mut range = None;
    let mut resume_offset = persisted_resume;

    if let Some(live_max) = live.iter().map(|s| s.max_offset).max() {
        let gap = OffsetRange {
            start: persisted_resume,
            end: live_max,
        };
        if !gap.is_empty() {
            range = Some(gap);
        }
        resume_offset = persisted_resume.max(live_max + 1);
    }

    if let Some(delay) = max_offset_delay {
        let lag = latest - resume_offset;
        if lag > 0 && lag.unsigned_abs() > delay {
            let start = range.map_or(resume_offset, |r: OffsetRange| r.start);
            range = Some(OffsetRange {
                start,
                end: latest - 1,
            });
            resume_offset = latest;
        }
    }

    let new_tasks = range
        .map(|r| subtract_covered(r, existing_tasks))
        .unwrap_or_default();

    RecoveryPlan {
        resume_offset,
        new_tasks,
        stale_live_markers: live.iter().map(|s| s.id.clone()).collect(),
    }
}

/// Pieces of `range` not already covered by an existing task.
fn subtract_covered(range: OffsetRange, existing: &[RecoveryTaskRecord]) -> Vec<OffsetRange> {
    let mut covered: Vec<_> = existing
        .iter()
        .map(|t| OffsetRange {
            start: t.start_offset,
            end: t.end_offset,
        })
        .filter(|r| !r.is_empty() && r.end >= range.start && r.start <= range.end)
        .collect();
    covered.sort_by_key(|r| r.start);

    let mut pieces = Vec::new();
    let mut cursor = range.start;
    for c in covered {
        if c.start > cursor {
            pieces.push(OffsetRange {
                start: cursor,
                end: c.start - 1,
            });
        }
        cursor = cursor.max(c.end + 1);
        if cursor > range.end {
            return pieces;
        }
    }
    pieces.push(OffsetRange {
        start: cursor,
        end: range.end,
    });
    pieces
}

/// Applies [`compute_plan`] against the coordination directory.
pub struct RecoveryPlanner {
    directory: Arc<dyn CoordinationDirectory>,
    max_offset_delay: Option<u64>,
}

impl RecoveryPlanner {
    pub fn new(directory: Arc<dyn CoordinationDirectory>, max_offset_delay: Option<u64>) -> Self {
        Self {
            directory,
            max_offset_delay,
        }
    }

    /// Create recovery tasks, clear this partition's live markers and return
    /// the offset to resume from.
    ///
    /// Directory failures surface as [`Error::Coordination`].
    pub fn plan(&self, partition_id: &str, earliest: Offset, latest: Offset) -> Result<RecoveryPlan> {
        let snapshots = self.directory.list_snapshots(partition_id).map_err(coordination)?;
        let existing = self
            .directory
            .list_recovery_tasks(partition_id)
            .map_err(coordination)?;

        let plan = compute_plan(&snapshots, &existing, earliest, latest, self.max_offset_delay);

        for range in &plan.new_tasks {
            let task = RecoveryTaskRecord {
                name: uuid::Uuid::new_v4().to_string(),
                partition_id: partition_id.to_string(),
                start_offset: range.start,
                end_offset: range.end,
                created_at_ms: chrono::Utc::now().timestamp_millis(),
            };
            self.directory.create_recovery_task(&task).map_err(coordination)?;
            warn!(
                "Created recovery task {} for partition {} covering offsets {}..={} ({} messages)",
                task.name,
                partition_id,
                range.start,
                range.end,
                range.len()
            );
        }

        for id in &plan.stale_live_markers {
            self.directory
                .delete_snapshot(partition_id, id)
                .map_err(coordination)?;
        }

        info!(
            "Recovery plan for partition {}: resume at {} (earliest {}, latest {}), {} new task(s), {} live marker(s) cleared",
            partition_id,
            plan.resume_offset,
            earliest,
            latest,
            plan.new_tasks.len(),
            plan.stale_live_markers.len()
        );
        Ok(plan)
    }
}

fn coordination(e: Error) -> Error {
    match e {
        Error::Coordination(_) => e,
        other => Error::coordination(other.to_string()),
    }
}
