//! Strata Indexer - indexes one broker partition into searchable chunks
//!
//! This binary wires the file-backed broker log, the redb coordination
//! directory and the filesystem blob store into an ingestion service.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_chunk::{FsBlobStore, TantivyIndexFactory};
use strata_common::{Config, IndexerMetrics};
use strata_ingest::{FileLog, IngestionContext, IngestionService, IngestionServiceConfig, ServiceState};
use strata_meta_store::{CoordinationDirectory, MetaStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-indexer")]
#[command(about = "Strata log indexer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/strata/indexer.toml")]
    config: PathBuf,

    /// Broker partition to index
    #[arg(short, long)]
    partition: Option<String>,

    /// Directory holding the broker partition logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Directory archived chunks are written to
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Coordination directory database path
    #[arg(long)]
    meta_path: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;

    // CLI takes precedence over the config file
    if let Some(partition) = args.partition {
        config.broker.partition_id = partition;
    }
    if let Some(log_dir) = args.log_dir {
        config.broker.log_dir = log_dir;
    }
    if let Some(blob_dir) = args.blob_dir {
        config.archive.blob_dir = blob_dir;
    }
    if let Some(meta_path) = args.meta_path {
        config.meta.path = meta_path;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("invalid configuration")?;

    info!("Starting Strata indexer");
    info!("Config file: {}", args.config.display());
    info!(
        "Partition: {} (topic {}, log dir {})",
        config.broker.partition_id,
        config.broker.topic,
        config.broker.log_dir.display()
    );
    info!("Blob directory: {}", config.archive.blob_dir.display());

    let meta = MetaStore::open(&config.meta.path)
        .with_context(|| format!("failed to open {}", config.meta.path.display()))?;
    for dataset in &config.datasets {
        meta.put_dataset(dataset)
            .with_context(|| format!("failed to provision dataset {}", dataset.name))?;
        info!(
            "Provisioned dataset {} ({} bytes/s)",
            dataset.name, dataset.throughput_bytes
        );
    }

    let metrics = Arc::new(IndexerMetrics::new());
    let ctx = IngestionContext {
        directory: Arc::new(meta),
        blob_store: Arc::new(FsBlobStore::new(config.archive.blob_dir.clone())),
        index_factory: Arc::new(TantivyIndexFactory),
        metrics: Arc::clone(&metrics),
    };
    let log = FileLog::new(
        &config.broker.log_dir,
        &config.broker.topic,
        &config.broker.partition_id,
    );
    let service = IngestionService::new(
        config.broker.partition_id.clone(),
        IngestionServiceConfig::from_config(&config),
        ctx,
        Box::new(log.consumer()),
    );

    if let Err(e) = service.start().await {
        error!("Failed to start ingestion: {}", e);
        service.stop().await.ok();
        return Err(e).context("ingestion startup failed");
    }
    info!("Indexing {}", log.path().display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        state = service.lifecycle().await_terminated() => {
            warn!("Ingestion reached {} on its own", state);
        }
    }

    let stopped = service.stop().await;
    info!("Final metrics:\n{}", metrics.export_prometheus("strata_indexer"));
    stopped.context("ingestion shutdown failed")?;

    if service.state() == ServiceState::Failed {
        anyhow::bail!(
            "ingestion failed: {}",
            service.failure_cause().unwrap_or_default()
        );
    }
    Ok(())
}
