//! The near-line data store daemon.
//!
//! Hosts the topic exchange and runs the configured stage consumers. Any
//! subset of stages may be enabled per process; replicas of the same stage
//! are extra consumers on the same queue.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use nearline_catalog::{CatalogProcessor, CatalogStore, PermissiveAuthenticator};
use nearline_core::config::AppConfig;
use nearline_core::routing as rk;
use nearline_core::{ApiAction, Details, Message, RoutingKey};
use nearline_fabric::topology::{
    declare_standard_queues, ARCHIVE_GET_QUEUE, ARCHIVE_PUT_QUEUE, CATALOG_QUEUE, INDEX_QUEUE,
    LOGGING_QUEUE, MARSHALLER_QUEUE, MONITOR_QUEUE, TRANSFER_GET_QUEUE, TRANSFER_PUT_QUEUE,
};
use nearline_fabric::{run_consumer, ConsumerOptions, Processor, Publisher, TopicExchange};
use nearline_monitor::{MonitorProcessor, MonitorStore};
use nearline_workers::{
    chown, groups::EtcGroupSource, ArchiveGetProcessor, ArchivePutProcessor, IndexerProcessor,
    LoggingProcessor, MarshallerProcessor, TransferGetProcessor, TransferPutProcessor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ALL_STAGES: &[&str] = &[
    "marshaller",
    "index",
    "catalog",
    "monitor",
    "transfer-put",
    "transfer-get",
    "archive-put",
    "archive-get",
    "logging",
];

/// Near-line data store daemon
#[derive(Parser, Debug)]
#[command(name = "nearlined")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "NEARLINE_CONFIG", default_value = "config/nearline.toml")]
    config: String,

    /// Stages to run in this process (default: all)
    #[arg(long, value_delimiter = ',')]
    stages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("nearlined v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!("no configuration file, using defaults and environment");
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("NEARLINE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    let stages: Vec<String> = if args.stages.is_empty() {
        ALL_STAGES.iter().map(|s| s.to_string()).collect()
    } else {
        args.stages
    };
    for stage in &stages {
        if !ALL_STAGES.contains(&stage.as_str()) {
            anyhow::bail!("unknown stage: {stage}");
        }
    }

    let exchange = declare_standard_queues(&config.fabric)?;
    tracing::info!(exchange = exchange.name(), "queue topology declared");

    let provider = nearline_storage::provider_from_config(
        &config.object_store,
        config.transfer_put_q.require_secure,
    )
    .await
    .context("failed to initialize object store provider")?;
    let tape = nearline_storage::tape_from_config(&config.tape)
        .await
        .context("failed to initialize tape store")?;

    let schedule = config.general.schedule();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for stage in &stages {
        let (queue, processor): (&str, Arc<dyn Processor>) = match stage.as_str() {
            "marshaller" => (MARSHALLER_QUEUE, Arc::new(MarshallerProcessor::new())),
            "index" => (
                INDEX_QUEUE,
                Arc::new(IndexerProcessor::new(
                    config.index_q.clone(),
                    schedule.clone(),
                    Arc::new(EtcGroupSource::new()),
                )),
            ),
            "catalog" => {
                let store = nearline_catalog::from_config(&config.catalog_q.db)
                    .await
                    .context("failed to initialize catalog store")?;
                store.health_check().await.context("catalog store unreachable")?;
                (
                    CATALOG_QUEUE,
                    Arc::new(CatalogProcessor::new(
                        store,
                        config.catalog_q.clone(),
                        Arc::new(PermissiveAuthenticator),
                        schedule.clone(),
                    )),
                )
            }
            "monitor" => {
                let store = nearline_monitor::from_config(&config.monitor_q.db)
                    .await
                    .context("failed to initialize monitor store")?;
                store.health_check().await.context("monitor store unreachable")?;
                (MONITOR_QUEUE, Arc::new(MonitorProcessor::new(store)))
            }
            "transfer-put" => (
                TRANSFER_PUT_QUEUE,
                Arc::new(TransferPutProcessor::new(
                    provider.clone(),
                    config.transfer_put_q.clone(),
                    schedule.clone(),
                )),
            ),
            "transfer-get" => (
                TRANSFER_GET_QUEUE,
                Arc::new(TransferGetProcessor::new(
                    provider.clone(),
                    config.transfer_get_q.clone(),
                    schedule.clone(),
                    chown::from_config(&config.transfer_get_q),
                )),
            ),
            "archive-put" => (
                ARCHIVE_PUT_QUEUE,
                Arc::new(ArchivePutProcessor::new(
                    provider.clone(),
                    tape.clone(),
                    config.archive_put_q.clone(),
                    schedule.clone(),
                )),
            ),
            "archive-get" => (
                ARCHIVE_GET_QUEUE,
                Arc::new(ArchiveGetProcessor::new(
                    provider.clone(),
                    tape.clone(),
                    config.archive_get_q.clone(),
                    schedule.clone(),
                )),
            ),
            "logging" => (
                LOGGING_QUEUE,
                Arc::new(LoggingProcessor::new(config.logging_q.clone())),
            ),
            other => anyhow::bail!("unknown stage: {other}"),
        };

        let exchange = exchange.clone();
        let shutdown = shutdown_rx.clone();
        let queue = queue.to_string();
        let options = ConsumerOptions {
            requeue_delay: schedule.delay_for(1),
        };
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_consumer(exchange, &queue, processor, options, shutdown).await {
                tracing::error!(queue, error = %e, "consumer exited with error");
            }
        }));
    }

    // the out-of-band trigger driving archive-put from the catalog
    if let Some(interval_secs) = config.archive_put_q.trigger_interval_secs {
        if stages.iter().any(|s| s == "catalog") {
            let trigger = spawn_archive_trigger(
                exchange.clone(),
                &config,
                Duration::from_secs(interval_secs),
                shutdown_rx.clone(),
            );
            handles.push(trigger);
            tracing::info!(interval_secs, "archive trigger scheduled");
        }
    }

    tracing::info!(stages = ?stages, "all consumers running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown_tx.send(true)?;
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Periodically publish `catalog-archive-next.start` so unarchived holdings
/// drain to tape.
fn spawn_archive_trigger(
    exchange: TopicExchange,
    config: &AppConfig,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let application = config.fabric.application.clone();
    let archive_config = config.archive_put_q.clone();
    tokio::spawn(async move {
        let publisher = Publisher::new(exchange);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            let mut details = Details::new("archiver", "archiver", ApiAction::ArchivePut);
            details.tenancy = archive_config.tenancy.clone();
            details.access_key = archive_config.access_key.clone();
            details.secret_key = archive_config.secret_key.clone();
            let message = Message::new(details);
            let key = match RoutingKey::new(&application, rk::CATALOG_ARCHIVE_NEXT, rk::START) {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(error = %e, "bad archive trigger key");
                    return;
                }
            };
            if let Err(e) = publisher.publish(&key, &message) {
                tracing::warn!(error = %e, "archive trigger publish failed");
            } else {
                tracing::info!("archive cycle triggered");
            }
        }
    })
}
