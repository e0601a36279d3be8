//! Configuration types for Strata
//!
//! Every section deserializes with defaults so a config file only needs to
//! name what it changes. [`Config::validate`] rejects values the components
//! would refuse at construction anyway, before anything is opened.

use crate::error::{Error, Result};
use crate::types::Dataset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for an indexer process
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexer: IndexerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub archive: ArchiveConfig,
    pub broker: BrokerConfig,
    pub meta: MetaConfig,
    pub logging: LoggingConfig,
    /// Datasets provisioned into the coordination directory at startup.
    pub datasets: Vec<Dataset>,
}

impl Config {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.indexer.validate()?;
        self.rate_limiter.validate()?;
        self.archive.validate()?;
        if self.broker.partition_id.is_empty() {
            return Err(Error::invalid_config("broker.partition_id must be set"));
        }
        if self.broker.partition_id.contains('/') {
            return Err(Error::invalid_config(
                "broker.partition_id must not contain '/'",
            ));
        }
        for ds in &self.datasets {
            if ds.name.is_empty() {
                return Err(Error::invalid_config("dataset name must not be empty"));
            }
        }
        Ok(())
    }
}

/// Chunk accumulation and query settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Roll over once the active chunk holds this many bytes
    pub max_bytes_per_chunk: u64,
    /// Roll over once the active chunk holds this many messages
    pub max_messages_per_chunk: u64,
    /// Skip ahead to the broker head when resuming further behind than
    /// this many offsets; the skipped range becomes a recovery task.
    /// `None` always resumes where the last run left off.
    pub max_offset_delay: Option<u64>,
    /// Refresh the live marker's max offset every N appended messages
    pub live_marker_refresh_messages: u64,
    /// Sealed chunks kept resident for queries after they are published
    pub max_resident_sealed_chunks: usize,
    /// Default deadline for queries in milliseconds
    pub default_query_timeout_ms: u64,
    /// Reload datasets from the coordination directory this often
    pub dataset_refresh_interval_ms: u64,
    /// Records fetched per broker poll
    pub poll_max_records: usize,
    /// Broker poll wait in milliseconds
    pub poll_timeout_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_chunk: 1024 * 1024 * 1024, // 1 GiB
            max_messages_per_chunk: 10_000_000,
            max_offset_delay: None,
            live_marker_refresh_messages: 10_000,
            max_resident_sealed_chunks: 4,
            default_query_timeout_ms: 3_000,
            dataset_refresh_interval_ms: 30_000,
            poll_max_records: 500,
            poll_timeout_ms: 250,
        }
    }
}

impl IndexerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_bytes_per_chunk == 0 || self.max_messages_per_chunk == 0 {
            return Err(Error::invalid_config(
                "indexer rollover thresholds must be positive",
            ));
        }
        if self.live_marker_refresh_messages == 0 {
            return Err(Error::invalid_config(
                "indexer.live_marker_refresh_messages must be positive",
            ));
        }
        if self.poll_max_records == 0 {
            return Err(Error::invalid_config(
                "indexer.poll_max_records must be positive",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.default_query_timeout_ms)
    }

    #[must_use]
    pub const fn dataset_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.dataset_refresh_interval_ms)
    }

    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Admission control settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Number of ingest instances sharing each dataset's throughput
    pub instance_count: u32,
    /// Seconds of throughput a bucket may accumulate as burst headroom
    pub max_burst_seconds: u32,
    /// Start buckets full instead of empty
    pub initialize_warm: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            max_burst_seconds: 1,
            initialize_warm: true,
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self) -> Result<()> {
        if self.instance_count == 0 {
            return Err(Error::invalid_config(
                "rate_limiter.instance_count must be positive",
            ));
        }
        if self.max_burst_seconds == 0 {
            return Err(Error::invalid_config(
                "rate_limiter.max_burst_seconds must be positive",
            ));
        }
        Ok(())
    }
}

/// Archival of sealed chunks
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory of the filesystem blob store
    pub blob_dir: PathBuf,
    /// Sealed chunks waiting for a worker before appends block
    pub queue_capacity: usize,
    /// Archival workers
    pub max_concurrent: usize,
    /// Read the blob back and compare checksums after upload
    pub verify_uploads: bool,
    /// How long shutdown waits for in-flight archival
    pub shutdown_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("/var/lib/strata/blobs"),
            queue_capacity: 4,
            max_concurrent: 2,
            verify_uploads: true,
            shutdown_timeout_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ArchiveConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 || self.max_concurrent == 0 {
            return Err(Error::invalid_config(
                "archive.queue_capacity and archive.max_concurrent must be positive",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::invalid_config(
                "archive.retry.multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Exponential backoff for retryable failures
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Broker source for this process
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub topic: String,
    /// The single partition this process owns
    pub partition_id: String,
    /// Directory holding `<topic>-<partition>.log` files
    pub log_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: "logs".to_string(),
            partition_id: "0".to_string(),
            log_dir: PathBuf::from("/var/lib/strata/broker"),
        }
    }
}

/// Coordination directory location
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub path: PathBuf,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/strata/meta.redb"),
        }
    }
}

/// Logging settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
