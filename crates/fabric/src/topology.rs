//! The standard queue topology: one work queue per stage.

use crate::error::FabricResult;
use crate::exchange::TopicExchange;
use nearline_core::config::FabricConfig;

pub const MARSHALLER_QUEUE: &str = "nearline";
pub const INDEX_QUEUE: &str = "index";
pub const CATALOG_QUEUE: &str = "catalog";
pub const TRANSFER_PUT_QUEUE: &str = "transfer-put";
pub const TRANSFER_GET_QUEUE: &str = "transfer-get";
pub const ARCHIVE_PUT_QUEUE: &str = "archive-put";
pub const ARCHIVE_GET_QUEUE: &str = "archive-get";
pub const MONITOR_QUEUE: &str = "monitor";
pub const LOGGING_QUEUE: &str = "logging";

/// Create the exchange and declare every stage queue with its bindings.
/// The marshaller's bindings are scoped to this deployment's application
/// segment; worker queues are generic (`*`/`#`) so they can serve several
/// applications.
pub fn declare_standard_queues(config: &FabricConfig) -> FabricResult<TopicExchange> {
    let exchange = TopicExchange::new(&config.exchange, config.prefetch);
    let app = &config.application;

    let marshaller_bindings = [
        format!("{app}.route.*"),
        format!("{app}.*.complete"),
        format!("{app}.*.reroute"),
        format!("{app}.*.failed"),
        format!("{app}.*.archive-restore"),
    ];
    exchange.declare_queue(
        MARSHALLER_QUEUE,
        &marshaller_bindings
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
    )?;
    exchange.declare_queue(INDEX_QUEUE, &["#.index.init", "#.index.start"])?;
    exchange.declare_queue(
        CATALOG_QUEUE,
        &[
            "*.catalog-put.start",
            "*.catalog-get.start",
            "*.catalog-del.start",
            "*.catalog-archive-next.start",
            "*.catalog-archive-update.start",
            "*.catalog-archive-del.start",
            "*.catalog-archive-remove.start",
            "*.catalog-remove.start",
            "*.catalog-update.start",
        ],
    )?;
    exchange.declare_queue(TRANSFER_PUT_QUEUE, &["*.transfer-put.init", "*.transfer-put.start"])?;
    exchange.declare_queue(TRANSFER_GET_QUEUE, &["*.transfer-get.init", "*.transfer-get.start"])?;
    exchange.declare_queue(ARCHIVE_PUT_QUEUE, &["*.archive-put.init", "*.archive-put.start"])?;
    exchange.declare_queue(
        ARCHIVE_GET_QUEUE,
        &[
            "*.archive-get.prepare",
            "*.archive-get.prepare-check",
            "*.archive-get.start",
        ],
    )?;
    exchange.declare_queue(MONITOR_QUEUE, &["*.monitor-put.start", "*.monitor-get.start"])?;
    exchange.declare_queue(LOGGING_QUEUE, &["*.log.*"])?;

    Ok(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearline_core::{ApiAction, Details, Message};

    #[tokio::test]
    async fn standard_topology_routes_each_stage() {
        let exchange = declare_standard_queues(&FabricConfig::default()).unwrap();
        let message = Message::new(Details::new("alice", "climate", ApiAction::Put));

        let cases = [
            ("nearline-api.route.put", MARSHALLER_QUEUE),
            ("nearline-api.index.complete", MARSHALLER_QUEUE),
            ("nearline-api.catalog-get.archive-restore", MARSHALLER_QUEUE),
            ("nearline-api.transfer-put.failed", MARSHALLER_QUEUE),
            ("nearline-api.index.init", INDEX_QUEUE),
            ("nearline-api.index.start", INDEX_QUEUE),
            ("nearline-api.catalog-put.start", CATALOG_QUEUE),
            ("nearline-api.catalog-archive-next.start", CATALOG_QUEUE),
            ("nearline-api.transfer-put.start", TRANSFER_PUT_QUEUE),
            ("nearline-api.transfer-get.init", TRANSFER_GET_QUEUE),
            ("nearline-api.archive-put.init", ARCHIVE_PUT_QUEUE),
            ("nearline-api.archive-get.prepare-check", ARCHIVE_GET_QUEUE),
            ("nearline-api.monitor-put.start", MONITOR_QUEUE),
            ("nearline-api.log.info", LOGGING_QUEUE),
        ];
        for (key, queue) in cases {
            let before = exchange.queue_depth(queue).unwrap();
            exchange.publish(&key.parse().unwrap(), &message).unwrap();
            assert_eq!(
                exchange.queue_depth(queue).unwrap(),
                before + 1,
                "key {key} must land on queue {queue}"
            );
        }
    }

    #[tokio::test]
    async fn foreign_application_does_not_reach_the_marshaller() {
        let exchange = declare_standard_queues(&FabricConfig::default()).unwrap();
        let message = Message::new(Details::new("alice", "climate", ApiAction::Put));
        exchange
            .publish(&"other-app.index.complete".parse().unwrap(), &message)
            .unwrap();
        assert_eq!(exchange.queue_depth(MARSHALLER_QUEUE).unwrap(), 0);
    }
}
