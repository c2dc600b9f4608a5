//! Shared fixtures: a full in-process deployment over temp directories.

use nearline_catalog::{CatalogProcessor, CatalogStore, PermissiveAuthenticator};
use nearline_core::config::{
    ArchiveGetConfig, ArchivePutConfig, CatalogConfig, DbConfig, IndexConfig, TransferGetConfig,
    TransferPutConfig,
};
use nearline_core::routing as rk;
use nearline_core::{ApiAction, Details, Message, PathDetails, RetrySchedule, RoutingKey, State};
use nearline_fabric::topology::{
    declare_standard_queues, ARCHIVE_GET_QUEUE, ARCHIVE_PUT_QUEUE, CATALOG_QUEUE, INDEX_QUEUE,
    MARSHALLER_QUEUE, MONITOR_QUEUE, TRANSFER_GET_QUEUE, TRANSFER_PUT_QUEUE,
};
use nearline_fabric::{
    run_consumer, ConsumerOptions, Processor, Publisher, QueueConsumer, TopicExchange,
};
use nearline_monitor::{rollup_state, MonitorProcessor, MonitorStore};
use nearline_storage::{
    DiskTape, FilesystemBackend, ObjectStore, ObjectStoreProvider, StorageError, StorageResult,
    StreamingUpload,
};
use nearline_workers::chown::NoChown;
use nearline_workers::groups::StaticGroupSource;
use nearline_workers::{
    ArchiveGetProcessor, ArchivePutProcessor, IndexerProcessor, MarshallerProcessor,
    TransferGetProcessor, TransferPutProcessor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub const TENANCY: &str = "tenancy.local";
pub const TAPE_URL: &str = "tape.local";

/// An object-store provider that fails the first `failures` uploads with a
/// retryable error, for back-off tests.
pub struct FlakyProvider {
    backend: Arc<FilesystemBackend>,
    remaining_failures: Arc<AtomicUsize>,
}

impl FlakyProvider {
    pub async fn new(root: &std::path::Path, failures: usize) -> Self {
        Self {
            backend: Arc::new(FilesystemBackend::new(root).await.unwrap()),
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
        }
    }
}

pub struct FlakyStore {
    backend: Arc<FilesystemBackend>,
    remaining_failures: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ObjectStoreProvider for FlakyProvider {
    async fn open(
        &self,
        _tenancy: &str,
        _access_key: &str,
        _secret_key: &str,
    ) -> StorageResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(FlakyStore {
            backend: self.backend.clone(),
            remaining_failures: self.remaining_failures.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl ObjectStore for FlakyStore {
    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.backend.ensure_bucket(bucket).await
    }
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        self.backend.exists(bucket, key).await
    }
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<nearline_storage::ObjectMeta> {
        self.backend.head(bucket, key).await
    }
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<nearline_storage::ByteStream> {
        self.backend.get_stream(bucket, key).await
    }
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::S3(
                "503 service unavailable".to_string().into(),
            ));
        }
        self.backend.put_stream(bucket, key).await
    }
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.backend.delete(bucket, key).await
    }
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        self.backend.list(bucket, prefix).await
    }
    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Knobs a scenario may turn before the deployment starts.
pub struct HarnessOptions {
    pub max_filesize: u64,
    pub filelist_max_length: usize,
    pub upload_failures: usize,
    pub full_unpack: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_filesize: nearline_core::DEFAULT_MAX_FILESIZE,
            filelist_max_length: 1000,
            upload_failures: 0,
            full_unpack: true,
        }
    }
}

/// A complete single-process deployment over a scratch directory.
pub struct Harness {
    pub temp: tempfile::TempDir,
    pub exchange: TopicExchange,
    pub catalog: Arc<dyn CatalogStore>,
    pub monitor: Arc<dyn MonitorStore>,
    pub objects: Arc<FilesystemBackend>,
    pub tape: Arc<DiskTape>,
    spy: QueueConsumer,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    pub async fn start() -> Harness {
        Self::start_with(HarnessOptions::default()).await
    }

    pub async fn start_with(options: HarnessOptions) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let objects_root = temp.path().join("objects");

        let exchange = declare_standard_queues(&Default::default()).unwrap();
        exchange.declare_queue("spy", &["#"]).unwrap();
        let spy = exchange.consumer_with_prefetch("spy", 1024).unwrap();

        let schedule = RetrySchedule::new(&[0, 0, 0], 3);
        let provider: Arc<dyn ObjectStoreProvider> = Arc::new(
            FlakyProvider::new(&objects_root, options.upload_failures).await,
        );
        let objects = Arc::new(FilesystemBackend::new(&objects_root).await.unwrap());
        let tape = Arc::new(
            DiskTape::new(
                temp.path().join("tape"),
                temp.path().join("tape-cache"),
                Duration::from_millis(20),
            )
            .await
            .unwrap(),
        );

        let catalog_config = CatalogConfig {
            db: DbConfig::sqlite(temp.path().join("catalog.db")),
            default_tenancy: Some(TENANCY.to_string()),
            default_tape_url: Some(TAPE_URL.to_string()),
            full_unpack: options.full_unpack,
        };
        let catalog = nearline_catalog::from_config(&catalog_config.db).await.unwrap();
        let monitor = nearline_monitor::from_config(&DbConfig::sqlite(
            temp.path().join("monitor.db"),
        ))
        .await
        .unwrap();

        let index_config = IndexConfig {
            check_permissions: false,
            max_filesize: options.max_filesize,
            filelist_max_length: options.filelist_max_length,
            ..IndexConfig::default()
        };
        let archive_put_config = ArchivePutConfig {
            tape_url: Some(TAPE_URL.to_string()),
            tenancy: Some(TENANCY.to_string()),
            access_key: Some(String::new()),
            secret_key: Some(String::new()),
            ..ArchivePutConfig::default()
        };
        let archive_get_config = ArchiveGetConfig {
            prepare_requeue_ms: 50,
            ..ArchiveGetConfig::default()
        };

        let stages: Vec<(&str, Arc<dyn Processor>)> = vec![
            (MARSHALLER_QUEUE, Arc::new(MarshallerProcessor::new())),
            (
                INDEX_QUEUE,
                Arc::new(IndexerProcessor::new(
                    index_config,
                    schedule.clone(),
                    Arc::new(StaticGroupSource::single("alice", 1000, vec![100])),
                )),
            ),
            (
                CATALOG_QUEUE,
                Arc::new(CatalogProcessor::new(
                    catalog.clone(),
                    catalog_config,
                    Arc::new(PermissiveAuthenticator),
                    schedule.clone(),
                )),
            ),
            (MONITOR_QUEUE, Arc::new(MonitorProcessor::new(monitor.clone()))),
            (
                TRANSFER_PUT_QUEUE,
                Arc::new(TransferPutProcessor::new(
                    provider.clone(),
                    TransferPutConfig::default(),
                    schedule.clone(),
                )),
            ),
            (
                TRANSFER_GET_QUEUE,
                Arc::new(TransferGetProcessor::new(
                    provider.clone(),
                    TransferGetConfig::default(),
                    schedule.clone(),
                    Arc::new(NoChown),
                )),
            ),
            (
                ARCHIVE_PUT_QUEUE,
                Arc::new(ArchivePutProcessor::new(
                    provider.clone(),
                    tape.clone(),
                    archive_put_config,
                    schedule.clone(),
                )),
            ),
            (
                ARCHIVE_GET_QUEUE,
                Arc::new(ArchiveGetProcessor::new(
                    provider.clone(),
                    tape.clone(),
                    archive_get_config,
                    schedule.clone(),
                )),
            ),
        ];

        let (shutdown, shutdown_rx) = watch::channel(false);
        for (queue, processor) in stages {
            let exchange = exchange.clone();
            let rx = shutdown_rx.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                let _ = run_consumer(
                    exchange,
                    &queue,
                    processor,
                    ConsumerOptions {
                        requeue_delay: Duration::from_millis(20),
                    },
                    rx,
                )
                .await;
            });
        }

        Harness {
            temp,
            exchange,
            catalog,
            monitor,
            objects,
            tape,
            spy,
            shutdown,
        }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.exchange.clone())
    }

    fn details(&self, action: ApiAction) -> Details {
        let mut details = Details::new("alice", "climate", action);
        details.tenancy = Some(TENANCY.to_string());
        details.access_key = Some(String::new());
        details.secret_key = Some(String::new());
        details
    }

    /// Submit a put of the given paths under a holding label. Returns the
    /// transaction id.
    pub fn put(&self, label: &str, paths: &[&std::path::Path]) -> Uuid {
        let mut details = self.details(ApiAction::Putlist);
        details.holding_label = Some(label.to_string());
        let filelist = paths
            .iter()
            .map(|p| PathDetails::from_path(p.to_string_lossy()))
            .collect();
        let message = Message::with_filelist(details, filelist);
        let txid = message.details.transaction_id;
        self.publisher()
            .publish(
                &RoutingKey::new(rk::ROOT, rk::ROUTE, rk::PUT).unwrap(),
                &message,
            )
            .unwrap();
        txid
    }

    /// Submit a get of the given original paths into a target directory.
    pub fn get(&self, label: &str, paths: &[&str], target: &std::path::Path) -> Uuid {
        let mut details = self.details(ApiAction::Getlist);
        details.holding_label = Some(label.to_string());
        details.target = Some(target.to_string_lossy().into_owned());
        let filelist = paths.iter().map(|p| PathDetails::from_path(*p)).collect();
        let message = Message::with_filelist(details, filelist);
        let txid = message.details.transaction_id;
        self.publisher()
            .publish(
                &RoutingKey::new(rk::ROOT, rk::ROUTE, rk::GET).unwrap(),
                &message,
            )
            .unwrap();
        txid
    }

    /// Fire the out-of-band archive trigger. Returns its transaction id.
    pub fn trigger_archive(&self) -> Uuid {
        let mut details = self.details(ApiAction::ArchivePut);
        details.user = "archiver".to_string();
        details.group = "archiver".to_string();
        let message = Message::new(details);
        let txid = message.details.transaction_id;
        self.publisher()
            .publish(
                &RoutingKey::new(rk::ROOT, rk::CATALOG_ARCHIVE_NEXT, rk::START).unwrap(),
                &message,
            )
            .unwrap();
        txid
    }

    /// Poll the monitor until the transaction's rollup reaches `state`.
    pub async fn wait_for_rollup(&self, txid: Uuid, state: State, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(current) = self.rollup(txid).await {
                if current == state {
                    return;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "transaction {txid} stuck at {current:?}, wanted {state:?}"
                );
            } else {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "transaction {txid} never appeared in the monitor"
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn rollup(&self, txid: Uuid) -> Option<State> {
        let trec = self
            .monitor
            .get_transaction_record(&txid.to_string())
            .await
            .unwrap()?;
        let subs = self.monitor.sub_records_of(trec.id).await.unwrap();
        let states: Vec<State> = subs
            .iter()
            .map(|s| s.parsed_state().unwrap())
            .collect();
        rollup_state(&states)
    }

    /// Drain every routing key the spy has seen so far.
    pub async fn drain_spy(&self) -> Vec<String> {
        let mut keys = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(50), self.spy.recv()).await {
                Ok(delivery) => {
                    keys.push(delivery.routing_key().to_string());
                    delivery.ack();
                }
                Err(_) => return keys,
            }
        }
    }

    pub fn stop(self) {
        let _ = self.shutdown.send(true);
    }
}
