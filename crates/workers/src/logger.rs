//! The logging worker: fans `*.log.*` messages out to size-rotated files.

use async_trait::async_trait;
use nearline_core::config::LoggingConfig;
use nearline_core::routing as rk;
use nearline_core::{Details, Message, RoutingKey};
use nearline_fabric::{Inbound, ProcessError, Processor, Publisher};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Handler for the logging queue.
pub struct LoggingProcessor {
    config: LoggingConfig,
}

impl LoggingProcessor {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    fn log_path(&self, application: &str) -> PathBuf {
        self.config.log_dir.join(format!("{application}.log"))
    }

    /// Rotate `path` through `.1 … .N` generations once it exceeds the size
    /// cap.
    async fn rotate_if_needed(&self, path: &PathBuf) -> std::io::Result<()> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if size < self.config.max_bytes {
            return Ok(());
        }
        for generation in (1..self.config.backup_count).rev() {
            let from = path.with_extension(format!("log.{generation}"));
            let to = path.with_extension(format!("log.{}", generation + 1));
            if tokio::fs::try_exists(&from).await? {
                tokio::fs::rename(&from, &to).await?;
            }
        }
        if self.config.backup_count > 0 {
            tokio::fs::rename(path, path.with_extension("log.1")).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn append(&self, inbound: &Inbound<'_>) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.config.log_dir).await?;
        let path = self.log_path(&inbound.key.application);
        self.rotate_if_needed(&path).await?;

        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let record = serde_json::json!({
            "timestamp": timestamp,
            "level": inbound.key.state,
            "application": inbound.key.application,
            "transaction_id": inbound.message.details.transaction_id,
            "message": inbound.message.meta.get("message"),
        });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{record}\n").as_bytes()).await?;
        file.flush().await
    }
}

/// Publish a log record onto the fabric for the logging worker.
pub fn publish_log(
    publisher: &Publisher,
    application: &str,
    level: &str,
    details: &Details,
    text: &str,
) -> nearline_fabric::FabricResult<()> {
    let key = RoutingKey::new(application, rk::LOG, level)?;
    let mut message = Message::new(details.clone());
    message.meta = serde_json::json!({ "message": text });
    publisher.publish(&key, &message)
}

#[async_trait]
impl Processor for LoggingProcessor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        self.append(&inbound)
            .await
            .map_err(|e| ProcessError::Transient(format!("log write failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearline_core::ApiAction;
    use nearline_fabric::{ConsumerOptions, TopicExchange};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    #[tokio::test]
    async fn log_messages_land_in_the_application_file() {
        let temp = tempfile::tempdir().unwrap();
        let exchange = TopicExchange::new("nearline", 1);
        exchange.declare_queue("logging", &["*.log.*"]).unwrap();

        let config = LoggingConfig {
            log_dir: temp.path().join("logs"),
            ..LoggingConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let consumer_exchange = exchange.clone();
        tokio::spawn(async move {
            nearline_fabric::run_consumer(
                consumer_exchange,
                "logging",
                Arc::new(LoggingProcessor::new(config)),
                ConsumerOptions::default(),
                rx,
            )
            .await
            .unwrap();
        });

        let publisher = Publisher::new(exchange.clone());
        let details = Details::new("alice", "climate", ApiAction::Put);
        publish_log(&publisher, "nearline-api", rk::LOG_INFO, &details, "indexing started")
            .unwrap();

        let path = temp.path().join("logs/nearline-api.log");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(body) = tokio::fs::read_to_string(&path).await {
                if body.contains("indexing started") && body.contains("\"level\":\"info\"") {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "log record never arrived"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn rotation_keeps_bounded_generations() {
        let temp = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: temp.path().to_path_buf(),
            max_bytes: 10,
            backup_count: 2,
        };
        let processor = LoggingProcessor::new(config);
        let path = processor.log_path("app");

        tokio::fs::write(&path, b"more than ten bytes of log").await.unwrap();
        processor.rotate_if_needed(&path).await.unwrap();
        assert!(!tokio::fs::try_exists(&path).await.unwrap());
        assert!(tokio::fs::try_exists(path.with_extension("log.1")).await.unwrap());

        tokio::fs::write(&path, b"another oversized record body").await.unwrap();
        processor.rotate_if_needed(&path).await.unwrap();
        assert!(tokio::fs::try_exists(path.with_extension("log.2")).await.unwrap());
    }
}
