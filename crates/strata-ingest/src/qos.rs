//! Admission control for multi-tenant ingestion
//!
//! Each dataset gets a byte-denominated token bucket sized to its share of
//! the cluster-wide throughput:
//!
//! ```text
//! rate     = throughput_bytes / instance_count        (bytes per second)
//! capacity = rate * max_burst_seconds                 (burst headroom)
//! ```
//!
//! A message is admitted by the first dataset whose service-name pattern
//! matches it and whose bucket has room. Buckets live for the process and
//! survive dataset refreshes as long as the dataset's throughput is unchanged.
//!
//! # Example
//!
//! ```ignore
//! let limiter = Arc::new(RateLimiter::new(&config.rate_limiter, metrics)?);
//! let admission = limiter.for_datasets(datasets);
//!
//! if admission.try_admit(&message).is_admitted() {
//!     chunk_store.append(&message).await?;
//! }
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use strata_common::config::RateLimiterConfig;
use strata_common::{Dataset, DropReason, Error, IndexerMetrics, Message, Result};
use tracing::debug;

/// Scale factor for sub-byte precision
const SCALE: u64 = 1000;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Dropped(DropReason),
}

impl Admission {
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug)]
struct BucketState {
    /// Scaled by [`SCALE`]
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Refill and debit happen under one lock, so concurrent callers never
/// lose updates. Contention is per bucket only.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Maximum tokens, scaled
    capacity: u64,
    /// Tokens added per second, scaled
    refill_rate: u64,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate_scaled / SCALE` tokens per second
    /// with `burst_seconds` worth of capacity.
    fn new(rate_scaled: u64, burst_seconds: u32, warm: bool) -> Self {
        let capacity = rate_scaled.saturating_mul(u64::from(burst_seconds));
        Self {
            state: Mutex::new(BucketState {
                tokens: if warm { capacity } else { 0 },
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate: rate_scaled,
        }
    }

    /// Bucket for one dataset on one of `instance_count` instances.
    #[must_use]
    pub fn for_throughput(
        throughput_bytes: u64,
        instance_count: u32,
        burst_seconds: u32,
        warm: bool,
    ) -> Self {
        let rate_scaled =
            throughput_bytes.saturating_mul(SCALE) / u64::from(instance_count.max(1));
        Self::new(rate_scaled, burst_seconds, warm)
    }

    /// Try to take `count` tokens without blocking.
    pub fn try_acquire(&self, count: u64) -> bool {
        let needed = count.saturating_mul(SCALE);
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens < needed {
            return false;
        }
        state.tokens -= needed;
        true
    }

    /// Tokens currently available
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens / SCALE
    }

    /// Maximum tokens the bucket can hold
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity / SCALE
    }

    #[allow(clippy::cast_possible_truncation)]
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_us = now.duration_since(state.last_refill).as_micros();
        let new_tokens = elapsed_us * u128::from(self.refill_rate) / 1_000_000;
        if new_tokens > 0 {
            let new_tokens = new_tokens.min(u128::from(u64::MAX)) as u64;
            state.tokens = state.tokens.saturating_add(new_tokens).min(self.capacity);
            state.last_refill = now;
        }
    }
}

struct DatasetBucket {
    throughput_bytes: u64,
    bucket: Arc<TokenBucket>,
}

/// Process-wide bucket registry keyed by dataset name.
pub struct RateLimiter {
    instance_count: u32,
    max_burst_seconds: u32,
    initialize_warm: bool,
    buckets: DashMap<String, DatasetBucket>,
    metrics: Arc<IndexerMetrics>,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig, metrics: Arc<IndexerMetrics>) -> Result<Self> {
        if config.instance_count == 0 {
            return Err(Error::invalid_config("instance count must be positive"));
        }
        if config.max_burst_seconds == 0 {
            return Err(Error::invalid_config("max burst seconds must be positive"));
        }
        Ok(Self {
            instance_count: config.instance_count,
            max_burst_seconds: config.max_burst_seconds,
            initialize_warm: config.initialize_warm,
            buckets: DashMap::new(),
            metrics,
        })
    }

    /// Bind the registry to a dataset list.
    pub fn for_datasets(self: &Arc<Self>, datasets: Vec<Dataset>) -> DatasetRateLimiter {
        debug!("Rate limiter bound to {} datasets", datasets.len());
        DatasetRateLimiter {
            limiter: Arc::clone(self),
            datasets,
        }
    }

    fn bucket_for(&self, dataset: &Dataset) -> Arc<TokenBucket> {
        if let Some(entry) = self.buckets.get(&dataset.name)
            && entry.throughput_bytes == dataset.throughput_bytes
        {
            return Arc::clone(&entry.bucket);
        }
        let mut entry = self
            .buckets
            .entry(dataset.name.clone())
            .or_insert_with(|| self.new_bucket(dataset.throughput_bytes));
        if entry.throughput_bytes != dataset.throughput_bytes {
            debug!(
                "Throughput of dataset {} changed to {} bytes/s, resetting bucket",
                dataset.name, dataset.throughput_bytes
            );
            *entry = self.new_bucket(dataset.throughput_bytes);
        }
        Arc::clone(&entry.bucket)
    }

    fn new_bucket(&self, throughput_bytes: u64) -> DatasetBucket {
        DatasetBucket {
            throughput_bytes,
            bucket: Arc::new(TokenBucket::for_throughput(
                throughput_bytes,
                self.instance_count,
                self.max_burst_seconds,
                self.initialize_warm,
            )),
        }
    }

    fn drop_messages(&self, reason: DropReason, messages: u64, bytes: u64) -> Admission {
        self.metrics.record_drop(reason, messages, bytes);
        Admission::Dropped(reason)
    }
}

/// Admission predicate over a fixed dataset list.
pub struct DatasetRateLimiter {
    limiter: Arc<RateLimiter>,
    datasets: Vec<Dataset>,
}

impl DatasetRateLimiter {
    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    /// Same bucket registry, new dataset list.
    #[must_use]
    pub fn rebind(&self, datasets: Vec<Dataset>) -> Self {
        self.limiter.for_datasets(datasets)
    }

    fn admit(&self, service_name: Option<&str>, messages: u64, bytes: u64) -> Admission {
        let mut matched = false;
        for dataset in &self.datasets {
            if !dataset.service_pattern.matches(service_name) {
                continue;
            }
            matched = true;
            if self.limiter.bucket_for(dataset).try_acquire(bytes) {
                return Admission::Admitted;
            }
        }
        let reason = if matched {
            DropReason::OverLimit
        } else {
            DropReason::NotProvisioned
        };
        self.limiter.drop_messages(reason, messages, bytes)
    }

    /// Admit or drop one message.
    pub fn try_admit(&self, message: &Message) -> Admission {
        self.admit(message.service_name.as_deref(), 1, message.size_bytes)
    }

    /// Admit or drop a whole batch against a single bucket.
    ///
    /// An empty batch is dropped without counting anything. A batch whose
    /// key carries no service name cannot be attributed to a dataset and is
    /// dropped as not provisioned.
    pub fn try_admit_batch(&self, key: Option<&str>, batch: &[Message]) -> Admission {
        if batch.is_empty() {
            return Admission::Dropped(DropReason::NotProvisioned);
        }
        let bytes: u64 = batch.iter().map(|m| m.size_bytes).sum();
        let messages = batch.len() as u64;
        match key {
            Some(service_name) if !service_name.is_empty() => {
                self.admit(Some(service_name), messages, bytes)
            }
            _ => self
                .limiter
                .drop_messages(DropReason::NotProvisioned, messages, bytes),
        }
    }
}
