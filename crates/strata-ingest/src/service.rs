//! Ingestion service for one partition
//!
//! Startup runs recovery, loads datasets, opens the chunk store at the
//! resume offset and spawns a single consumption task. Shutdown stops the
//! task, seals and archives the active chunk, and closes the consumer.
//!
//! ```text
//! broker ─poll─▶ records ─▶ Message ─▶ DatasetRateLimiter ─admit─▶ ChunkStore
//!                                              │
//!                                              └─ dropped (counted by reason)
//! ```

use crate::broker::{BrokerConsumer, BrokerRecord};
use crate::lifecycle::{Lifecycle, ServiceState};
use crate::qos::{Admission, DatasetRateLimiter, RateLimiter};
use crate::recovery::RecoveryPlanner;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use strata_chunk::{BlobStore, ChunkStore, ChunkStoreConfig, IndexFactory, SearchQuery, SearchResult};
use strata_common::config::{IndexerConfig, RateLimiterConfig};
use strata_common::{Config, Error, IndexerMetrics, Message, Result};
use strata_meta_store::CoordinationDirectory;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings the service needs from [`Config`].
#[derive(Debug, Clone, Default)]
pub struct IngestionServiceConfig {
    pub indexer: IndexerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub chunk_store: ChunkStoreConfig,
}

impl IngestionServiceConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            indexer: config.indexer.clone(),
            rate_limiter: config.rate_limiter.clone(),
            chunk_store: ChunkStoreConfig::from_config(&config.indexer, &config.archive),
        }
    }
}

/// Shared collaborators handed to the service.
#[derive(Clone)]
pub struct IngestionContext {
    pub directory: Arc<dyn CoordinationDirectory>,
    pub blob_store: Arc<dyn BlobStore>,
    pub index_factory: Arc<dyn IndexFactory>,
    pub metrics: Arc<IndexerMetrics>,
}

type Consumer = Box<dyn BrokerConsumer>;

/// Indexes one broker partition into chunks.
pub struct IngestionService {
    partition_id: String,
    config: IngestionServiceConfig,
    ctx: IngestionContext,
    lifecycle: Arc<Lifecycle>,
    consumer: Mutex<Option<Consumer>>,
    chunk_store: RwLock<Option<Arc<ChunkStore>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Consumer>>>,
    stopped: Mutex<bool>,
}

impl IngestionService {
    pub fn new(
        partition_id: impl Into<String>,
        config: IngestionServiceConfig,
        ctx: IngestionContext,
        consumer: Consumer,
    ) -> Self {
        let partition_id = partition_id.into();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            lifecycle: Arc::new(Lifecycle::new(format!("ingestion[{partition_id}]"))),
            partition_id,
            config,
            ctx,
            consumer: Mutex::new(Some(consumer)),
            chunk_store: RwLock::new(None),
            shutdown_tx,
            task: Mutex::new(None),
            stopped: Mutex::new(false),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn failure_cause(&self) -> Option<String> {
        self.lifecycle.failure_cause()
    }

    pub fn metrics(&self) -> &Arc<IndexerMetrics> {
        &self.ctx.metrics
    }

    /// The chunk store, once startup has opened it.
    pub fn chunk_store(&self) -> Option<Arc<ChunkStore>> {
        self.chunk_store.read().clone()
    }

    /// Recover, open the chunk store and start consuming.
    ///
    /// On error the service is left `Failed`; [`stop`](Self::stop) still
    /// releases whatever was acquired.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.transition(ServiceState::Starting)?;

        let Some(mut consumer) = self.consumer.lock().await.take() else {
            let e = Error::IllegalState("broker consumer already taken".into());
            self.lifecycle.fail(e.to_string());
            return Err(e);
        };

        match self.prepare(consumer.as_mut()).await {
            Ok((store, admission)) => {
                let consume = ConsumeLoop {
                    consumer,
                    fatal_rx: store.fatal_signal(),
                    indexer: RecordIndexer {
                        partition_id: self.partition_id.clone(),
                        store,
                        admission,
                        metrics: Arc::clone(&self.ctx.metrics),
                    },
                    directory: Arc::clone(&self.ctx.directory),
                    lifecycle: Arc::clone(&self.lifecycle),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    refresh_interval: self.config.indexer.dataset_refresh_interval(),
                    poll_max_records: self.config.indexer.poll_max_records,
                    poll_timeout: self.config.indexer.poll_timeout(),
                };
                *self.task.lock().await = Some(tokio::spawn(consume.run()));
                self.lifecycle.transition(ServiceState::Running)
            }
            Err(e) => {
                *self.consumer.lock().await = Some(consumer);
                self.lifecycle.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        consumer: &mut dyn BrokerConsumer,
    ) -> Result<(Arc<ChunkStore>, DatasetRateLimiter)> {
        let earliest = consumer.earliest_offset().await?;
        let latest = consumer.latest_offset().await?;

        let planner = RecoveryPlanner::new(
            Arc::clone(&self.ctx.directory),
            self.config.indexer.max_offset_delay,
        );
        let plan = planner.plan(&self.partition_id, earliest, latest)?;

        let datasets = self.ctx.directory.list_datasets()?;
        let limiter = Arc::new(RateLimiter::new(
            &self.config.rate_limiter,
            Arc::clone(&self.ctx.metrics),
        )?);
        info!(
            "Partition {} admitting traffic for {} dataset(s)",
            self.partition_id,
            datasets.len()
        );
        let admission = limiter.for_datasets(datasets);

        let store = Arc::new(ChunkStore::open(
            self.partition_id.clone(),
            self.config.chunk_store.clone(),
            plan.resume_offset,
            Arc::clone(&self.ctx.directory),
            Arc::clone(&self.ctx.blob_store),
            Arc::clone(&self.ctx.index_factory),
            Arc::clone(&self.ctx.metrics),
        )?);
        *self.chunk_store.write() = Some(Arc::clone(&store));

        consumer.seek(plan.resume_offset).await?;
        Ok((store, admission))
    }

    /// Stop consuming, seal and archive the active chunk, close the consumer.
    ///
    /// Safe to call more than once and after a failure; only the first call
    /// does any work.
    pub async fn stop(&self) -> Result<()> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }
        *stopped = true;

        if matches!(self.state(), ServiceState::Starting | ServiceState::Running)
            && let Err(e) = self.lifecycle.transition(ServiceState::Stopping)
        {
            debug!("Partition {} not marked stopping: {}", self.partition_id, e);
        }
        self.shutdown_tx.send_replace(true);

        let task = self.task.lock().await.take();
        if let Some(handle) = task {
            match handle.await {
                Ok(consumer) => *self.consumer.lock().await = Some(consumer),
                Err(e) => warn!("Consumption task for partition {} panicked: {}", self.partition_id, e),
            }
        }

        let mut result = Ok(());
        if let Some(store) = self.chunk_store() {
            if let Err(e) = store.close().await {
                warn!("Failed to close chunk store for partition {}: {}", self.partition_id, e);
                result = Err(e);
            }
            let archive_failure = store.fatal_signal().borrow().clone();
            if let Some(reason) = archive_failure {
                self.lifecycle.fail(reason);
            }
        }

        let consumer = self.consumer.lock().await.take();
        if let Some(mut consumer) = consumer
            && let Err(e) = consumer.close().await
        {
            warn!("Failed to close consumer for partition {}: {}", self.partition_id, e);
        }

        if self.state() != ServiceState::Failed {
            self.lifecycle.transition(ServiceState::Terminated)?;
        }
        info!(
            "Ingestion for partition {} stopped in state {}",
            self.partition_id,
            self.state()
        );
        result
    }

    /// Search the resident chunks with the configured default timeout.
    pub async fn query(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.query_with_timeout(query, self.config.indexer.query_timeout())
            .await
    }

    pub async fn query_with_timeout(
        &self,
        query: &SearchQuery,
        timeout: Duration,
    ) -> Result<SearchResult> {
        let store = self
            .chunk_store()
            .ok_or_else(|| Error::IllegalState("ingestion service has not started".into()))?;
        Ok(store.query(query, timeout).await)
    }
}

#[derive(Deserialize)]
struct PayloadServiceName {
    #[serde(default)]
    service_name: Option<String>,
}

/// Service name from the record key, falling back to the payload.
fn service_name_of(record: &BrokerRecord) -> Option<String> {
    match &record.key {
        Some(key) if !key.is_empty() => Some(key.clone()),
        _ => serde_json::from_slice::<PayloadServiceName>(&record.value)
            .ok()
            .and_then(|p| p.service_name),
    }
}

/// Turns broker records into admitted, indexed messages.
struct RecordIndexer {
    partition_id: String,
    store: Arc<ChunkStore>,
    admission: DatasetRateLimiter,
    metrics: Arc<IndexerMetrics>,
}

impl RecordIndexer {
    async fn process(&self, records: Vec<BrokerRecord>) -> Result<()> {
        for record in records {
            self.metrics.records_received.inc();
            if record.value.is_empty() {
                self.metrics.records_failed.inc();
                debug!("Skipping empty record at offset {}", record.offset);
                continue;
            }

            let service_name = service_name_of(&record);
            let message = Message::new(
                self.partition_id.as_str(),
                record.offset,
                record.value,
                service_name,
            );
            if let Admission::Dropped(reason) = self.admission.try_admit(&message) {
                debug!(
                    "Dropped message at offset {} for service {:?}: {}",
                    message.offset,
                    message.service_name,
                    reason.as_str()
                );
                continue;
            }

            match self.store.append(&message).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Failed to index message at offset {}: {}", message.offset, e),
            }
        }
        Ok(())
    }
}

struct ConsumeLoop {
    consumer: Consumer,
    indexer: RecordIndexer,
    directory: Arc<dyn CoordinationDirectory>,
    lifecycle: Arc<Lifecycle>,
    shutdown_rx: watch::Receiver<bool>,
    fatal_rx: watch::Receiver<Option<String>>,
    refresh_interval: Duration,
    poll_max_records: usize,
    poll_timeout: Duration,
}

impl ConsumeLoop {
    async fn run(mut self) -> Consumer {
        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => break,

                changed = self.fatal_rx.changed() => {
                    let reason = self.fatal_rx.borrow_and_update().clone();
                    match (changed, reason) {
                        (_, Some(reason)) => {
                            self.lifecycle.fail(reason);
                            break;
                        }
                        (Err(_), None) => break,
                        (Ok(()), None) => {}
                    }
                }

                _ = refresh.tick() => self.refresh_datasets(),

                polled = self.consumer.poll(self.poll_max_records, self.poll_timeout) => {
                    let outcome = match polled {
                        Ok(records) => self.indexer.process(records).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        if e.is_fatal() {
                            self.lifecycle.fail(e.to_string());
                            break;
                        }
                        warn!("Partition {}: {}", self.indexer.partition_id, e);
                    }
                }
            }
        }
        debug!(
            "Consumption task for partition {} exiting",
            self.indexer.partition_id
        );
        self.consumer
    }

    fn refresh_datasets(&mut self) {
        match self.directory.list_datasets() {
            Ok(datasets) => {
                debug!("Refreshed {} dataset(s)", datasets.len());
                self.indexer.admission = self.indexer.admission.rebind(datasets);
            }
            Err(e) => warn!("Dataset refresh failed, keeping previous list: {}", e),
        }
    }
}
