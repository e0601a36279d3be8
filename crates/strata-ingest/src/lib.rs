//! Strata Ingest - admission control, recovery and the partition ingestion
//! service
//!
//! One [`IngestionService`] runs per broker partition. At startup the
//! [`RecoveryPlanner`] turns crash leftovers into recovery tasks and picks the
//! resume offset; afterwards every record passes the [`DatasetRateLimiter`]
//! before it reaches the chunk store.

pub mod broker;
pub mod lifecycle;
pub mod qos;
pub mod recovery;
pub mod service;

pub use broker::{BrokerConsumer, BrokerRecord, FileLog, FileLogConsumer, MemoryBroker, MemoryConsumer};
pub use lifecycle::{Lifecycle, ServiceState};
pub use qos::{Admission, DatasetRateLimiter, RateLimiter, TokenBucket};
pub use recovery::{OffsetRange, RecoveryPlan, RecoveryPlanner, compute_plan};
pub use service::{IngestionContext, IngestionService, IngestionServiceConfig};
