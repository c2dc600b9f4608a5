//! The marshaller: the stateless router deciding each next stage.
//!
//! All correlation data lives in the envelope — in particular, whether a
//! `catalog-update.complete` closes a put or continues a get is read off the
//! message's `api_action`, never from router memory.

use async_trait::async_trait;
use nearline_core::routing as rk;
use nearline_core::State;
use nearline_fabric::{Inbound, ProcessError, Processor};

/// Stateless routing worker.
pub struct MarshallerProcessor;

impl MarshallerProcessor {
    pub fn new() -> Self {
        Self
    }

    fn forward(
        &self,
        inbound: &Inbound<'_>,
        worker: &str,
        state: &str,
    ) -> Result<(), ProcessError> {
        let key = inbound.key.reply(worker, state);
        tracing::info!(from = %inbound.key, to = %key, "routing");
        inbound
            .publisher
            .publish(&key, inbound.message)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    fn monitor(&self, inbound: &Inbound<'_>, state: State) -> Result<(), ProcessError> {
        inbound
            .publisher
            .notify_monitor(inbound.key, inbound.message, state)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }
}

impl Default for MarshallerProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for MarshallerProcessor {
    fn name(&self) -> &'static str {
        "marshaller"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        let worker = inbound.key.worker.as_str();
        let state = inbound.key.state.as_str();
        let api_action = inbound.message.details.api_action;

        match (worker, state) {
            // fresh API commands
            (rk::ROUTE, rk::PUT) => {
                self.monitor(&inbound, State::Routing)?;
                self.forward(&inbound, rk::INDEX, rk::INITIATE)
            }
            (rk::ROUTE, rk::GET) => {
                self.monitor(&inbound, State::Routing)?;
                self.forward(&inbound, rk::CATALOG_GET, rk::START)
            }
            (rk::ROUTE, rk::DEL) => {
                self.monitor(&inbound, State::Routing)?;
                self.forward(&inbound, rk::CATALOG_DEL, rk::START)
            }

            // put workflow
            (rk::INDEX, rk::COMPLETE) => self.forward(&inbound, rk::CATALOG_PUT, rk::START),
            (rk::CATALOG_PUT, rk::COMPLETE) => {
                self.forward(&inbound, rk::TRANSFER_PUT, rk::INITIATE)
            }
            (rk::TRANSFER_PUT, rk::COMPLETE) => {
                self.forward(&inbound, rk::CATALOG_UPDATE, rk::START)
            }
            // a failed transfer strips the provisional file rows
            (rk::TRANSFER_PUT, rk::FAILED) => self.forward(&inbound, rk::CATALOG_DEL, rk::START),

            // a catalog-update closes a put, but a recalled get continues to
            // the disk transfer
            (rk::CATALOG_UPDATE, rk::COMPLETE) => {
                if api_action.is_get() {
                    self.forward(&inbound, rk::TRANSFER_GET, rk::INITIATE)
                } else {
                    self.monitor(&inbound, State::Complete)
                }
            }

            // get workflow
            (rk::CATALOG_GET, rk::COMPLETE) => {
                self.forward(&inbound, rk::TRANSFER_GET, rk::INITIATE)
            }
            (rk::CATALOG_GET, rk::ARCHIVE_RESTORE) => {
                self.forward(&inbound, rk::ARCHIVE_GET, rk::PREPARE)
            }
            (rk::ARCHIVE_GET, rk::COMPLETE) => {
                self.forward(&inbound, rk::CATALOG_UPDATE, rk::START)
            }
            // a failed recall strips the empty object-store markers so the
            // next get can schedule a fresh one
            (rk::ARCHIVE_GET, rk::FAILED) => self.forward(&inbound, rk::CATALOG_REMOVE, rk::START),
            (rk::TRANSFER_GET, rk::COMPLETE) => self.monitor(&inbound, State::Complete),

            // archive workflow
            (rk::CATALOG_ARCHIVE_NEXT, rk::COMPLETE) => {
                self.forward(&inbound, rk::ARCHIVE_PUT, rk::INITIATE)
            }
            (rk::ARCHIVE_PUT, rk::COMPLETE) => {
                self.forward(&inbound, rk::CATALOG_ARCHIVE_UPDATE, rk::START)
            }
            (rk::ARCHIVE_PUT, rk::FAILED) => {
                self.forward(&inbound, rk::CATALOG_ARCHIVE_REMOVE, rk::START)
            }
            (rk::CATALOG_ARCHIVE_UPDATE, rk::COMPLETE) => self.monitor(&inbound, State::Complete),

            // permanently failed stages already reported their state; the
            // files stop here
            (_, rk::FAILED) => {
                tracing::info!(key = %inbound.key, "terminal failure, no onward route");
                Ok(())
            }
            _ => {
                tracing::debug!(key = %inbound.key, "no route for event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearline_core::{ApiAction, Details, Message};
    use nearline_fabric::{ConsumerOptions, TopicExchange};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Exchange with the marshaller running and a spy queue capturing every
    /// message it emits.
    async fn harness() -> (TopicExchange, watch::Sender<bool>) {
        let exchange = TopicExchange::new("nearline", 1);
        exchange
            .declare_queue(
                "nearline",
                &[
                    "nearline-api.route.*",
                    "nearline-api.*.complete",
                    "nearline-api.*.reroute",
                    "nearline-api.*.failed",
                    "nearline-api.*.archive-restore",
                ],
            )
            .unwrap();
        exchange.declare_queue("spy", &["#"]).unwrap();
        let (tx, rx) = watch::channel(false);
        let looped = exchange.clone();
        tokio::spawn(async move {
            nearline_fabric::run_consumer(
                looped,
                "nearline",
                Arc::new(MarshallerProcessor::new()),
                ConsumerOptions {
                    requeue_delay: Duration::from_millis(10),
                },
                rx,
            )
            .await
            .unwrap();
        });
        (exchange, tx)
    }

    async fn drain_keys(exchange: &TopicExchange, expect: usize) -> Vec<String> {
        let spy = exchange.consumer_with_prefetch("spy", 64).unwrap();
        let mut keys = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while keys.len() < expect {
            let delivery = tokio::time::timeout_at(deadline, spy.recv())
                .await
                .expect("spy starved waiting for routed messages");
            keys.push(delivery.routing_key().to_string());
            delivery.ack();
        }
        keys.sort();
        keys
    }

    fn message(action: ApiAction) -> Message {
        Message::new(Details::new("alice", "climate", action))
    }

    #[tokio::test]
    async fn route_put_goes_to_indexer() {
        let (exchange, shutdown) = harness().await;
        exchange
            .publish(
                &"nearline-api.route.put".parse().unwrap(),
                &message(ApiAction::Put),
            )
            .unwrap();
        // the route itself + index.init + monitor update
        let keys = drain_keys(&exchange, 3).await;
        assert!(keys.contains(&"nearline-api.index.init".to_string()));
        assert!(keys.contains(&"nearline-api.monitor-put.start".to_string()));
        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn transitions_follow_the_table() {
        let cases = [
            ("nearline-api.index.complete", "nearline-api.catalog-put.start", ApiAction::Put),
            ("nearline-api.catalog-put.complete", "nearline-api.transfer-put.init", ApiAction::Put),
            ("nearline-api.transfer-put.complete", "nearline-api.catalog-update.start", ApiAction::Put),
            ("nearline-api.transfer-put.failed", "nearline-api.catalog-del.start", ApiAction::Put),
            ("nearline-api.catalog-get.complete", "nearline-api.transfer-get.init", ApiAction::Get),
            ("nearline-api.catalog-get.archive-restore", "nearline-api.archive-get.prepare", ApiAction::Get),
            ("nearline-api.archive-get.complete", "nearline-api.catalog-update.start", ApiAction::Get),
            ("nearline-api.archive-get.failed", "nearline-api.catalog-remove.start", ApiAction::Get),
            ("nearline-api.catalog-archive-next.complete", "nearline-api.archive-put.init", ApiAction::ArchivePut),
            ("nearline-api.archive-put.complete", "nearline-api.catalog-archive-update.start", ApiAction::ArchivePut),
            ("nearline-api.archive-put.failed", "nearline-api.catalog-archive-remove.start", ApiAction::ArchivePut),
        ];
        for (trigger, expected, action) in cases {
            let (exchange, shutdown) = harness().await;
            exchange
                .publish(&trigger.parse().unwrap(), &message(action))
                .unwrap();
            let keys = drain_keys(&exchange, 2).await;
            assert!(
                keys.contains(&expected.to_string()),
                "{trigger} must route to {expected}, saw {keys:?}"
            );
            shutdown.send(true).unwrap();
        }
    }

    #[tokio::test]
    async fn catalog_update_complete_splits_on_api_action() {
        // put: terminal, only a monitor update is emitted
        let (exchange, shutdown) = harness().await;
        exchange
            .publish(
                &"nearline-api.catalog-update.complete".parse().unwrap(),
                &message(ApiAction::Put),
            )
            .unwrap();
        let keys = drain_keys(&exchange, 2).await;
        assert!(keys.contains(&"nearline-api.monitor-put.start".to_string()));
        assert!(!keys.iter().any(|k| k.contains("transfer-get")));
        shutdown.send(true).unwrap();

        // get: the recalled files continue to the disk transfer
        let (exchange, shutdown) = harness().await;
        exchange
            .publish(
                &"nearline-api.catalog-update.complete".parse().unwrap(),
                &message(ApiAction::Getlist),
            )
            .unwrap();
        let keys = drain_keys(&exchange, 2).await;
        assert!(keys.contains(&"nearline-api.transfer-get.init".to_string()));
        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn terminal_failures_do_not_route_onward() {
        let (exchange, shutdown) = harness().await;
        exchange
            .publish(
                &"nearline-api.index.failed".parse().unwrap(),
                &message(ApiAction::Put),
            )
            .unwrap();
        // only the trigger itself ever reaches the spy
        tokio::time::sleep(Duration::from_millis(100)).await;
        let keys = drain_keys(&exchange, 1).await;
        assert_eq!(keys, vec!["nearline-api.index.failed".to_string()]);
        shutdown.send(true).unwrap();
    }
}
