//! Core type definitions for Strata
//!
//! Datasets and their service-name patterns, broker messages, the log
//! document schema, and the coordination records (snapshots and recovery
//! tasks) that survive restarts.

use bytes::Bytes;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Broker offset. `-1` means nothing has been consumed.
pub type Offset = i64;

/// Path value that marks a snapshot record as a live (not yet archived) chunk.
pub const LIVE_SNAPSHOT_PATH: &str = "LIVE";

/// Version stamped on every snapshot record written by this build.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Unique identifier for a chunk
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, From, Serialize, Deserialize)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Generate a new random chunk ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which service names a dataset claims.
///
/// On the wire this is an optional string: `"_all"` and `"*"` match every
/// service, a missing value is a legacy dataset that also matches everything,
/// and any other string is an exact service name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ServiceNamePattern {
    Exact(String),
    MatchAll,
    Wildcard,
    #[default]
    LegacyNull,
}

impl ServiceNamePattern {
    pub const MATCH_ALL: &'static str = "_all";
    pub const WILDCARD: &'static str = "*";

    /// Whether a message with this service name belongs to the dataset.
    #[must_use]
    pub fn matches(&self, service_name: Option<&str>) -> bool {
        match self {
            Self::Exact(name) => service_name == Some(name.as_str()),
            Self::MatchAll | Self::Wildcard | Self::LegacyNull => true,
        }
    }
}

impl From<Option<String>> for ServiceNamePattern {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Self::LegacyNull,
            Some(s) if s == Self::MATCH_ALL => Self::MatchAll,
            Some(s) if s == Self::WILDCARD => Self::Wildcard,
            Some(s) => Self::Exact(s),
        }
    }
}

impl From<ServiceNamePattern> for Option<String> {
    fn from(pattern: ServiceNamePattern) -> Self {
        match pattern {
            ServiceNamePattern::Exact(name) => Some(name),
            ServiceNamePattern::MatchAll => Some(ServiceNamePattern::MATCH_ALL.to_string()),
            ServiceNamePattern::Wildcard => Some(ServiceNamePattern::WILDCARD.to_string()),
            ServiceNamePattern::LegacyNull => None,
        }
    }
}

/// Time window during which a dataset writes to a set of partitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub partition_ids: BTreeSet<String>,
}

/// A tenant-facing logical grouping with a provisioned throughput.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    /// Cluster-wide target in bytes per second.
    pub throughput_bytes: u64,
    #[serde(default)]
    pub partition_assignments: Vec<PartitionAssignment>,
    #[serde(default)]
    pub service_pattern: ServiceNamePattern,
}

/// Log document carried in a message payload (JSON).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub id: String,
    #[serde(alias = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// One record handed from the broker to the indexer.
#[derive(Clone, Debug)]
pub struct Message {
    pub payload: Bytes,
    pub size_bytes: u64,
    pub partition_id: String,
    pub offset: Offset,
    pub service_name: Option<String>,
}

impl Message {
    pub fn new(
        partition_id: impl Into<String>,
        offset: Offset,
        payload: impl Into<Bytes>,
        service_name: Option<String>,
    ) -> Self {
        let payload = payload.into();
        Self {
            size_bytes: payload.len() as u64,
            payload,
            partition_id: partition_id.into(),
            offset,
            service_name,
        }
    }
}

/// Durable record describing one chunk of a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    /// Blob path, or [`LIVE_SNAPSHOT_PATH`] while the chunk is still local.
    pub path: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub max_offset: Offset,
    pub partition_id: String,
    pub index_format_version: u32,
}

impl SnapshotRecord {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.path == LIVE_SNAPSHOT_PATH
    }
}

/// A closed offset range `[start_offset, end_offset]` that must be
/// re-indexed out of band.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTaskRecord {
    pub name: String,
    pub partition_id: String,
    pub start_offset: Offset,
    pub end_offset: Offset,
    pub created_at_ms: i64,
}

/// Why the rate limiter refused a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// No dataset claims the message's service name.
    NotProvisioned,
    /// Every matching dataset is out of tokens.
    OverLimit,
}

impl DropReason {
    pub const ALL: [Self; 2] = [Self::NotProvisioned, Self::OverLimit];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotProvisioned => "NOT_PROVISIONED",
            Self::OverLimit => "OVER_LIMIT",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::NotProvisioned => 0,
            Self::OverLimit => 1,
        }
    }
}
