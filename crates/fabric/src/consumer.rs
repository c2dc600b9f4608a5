//! The worker loop shared by every stage consumer.
//!
//! A stage implements [`Processor`]; [`run_consumer`] drives the
//! receive → decode → process → ack cycle, answers system-status pings, and
//! applies the error taxonomy: transient failures requeue with a delay,
//! protocol failures are dropped with a critical log, fatal failures halt
//! the consumer without requeueing the poisoned message.

use crate::error::FabricResult;
use crate::exchange::{Delivery, Publisher, TopicExchange};
use crate::rpc::SystemStatus;
use async_trait::async_trait;
use nearline_core::{ApiAction, Message, RoutingKey};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// How a stage failed to process a message.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Broker/store/network trouble: requeue with a delay.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed envelope or unknown state: drop, never retry.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// Misconfiguration or corruption: halt the consumer.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

/// A decoded inbound message plus the means to publish onward.
pub struct Inbound<'a> {
    pub key: &'a RoutingKey,
    pub message: &'a Message,
    pub delivery: &'a Delivery,
    pub publisher: &'a Publisher,
}

/// One processing stage.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Stage name, used in logs and the consumer tag.
    fn name(&self) -> &'static str;

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError>;
}

/// Options for a consumer loop.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Delay applied when a transient failure requeues the message.
    pub requeue_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            requeue_delay: Duration::from_secs(30),
        }
    }
}

/// Run a consumer until the shutdown signal flips to `true` or the processor
/// reports a fatal error.
pub async fn run_consumer(
    exchange: TopicExchange,
    queue: &str,
    processor: Arc<dyn Processor>,
    options: ConsumerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> FabricResult<()> {
    let consumer = exchange.consumer(queue)?;
    let publisher = Publisher::new(exchange.clone());
    tracing::info!(
        stage = processor.name(),
        queue,
        consumer_tag = consumer.consumer_tag(),
        "consumer started"
    );

    loop {
        let delivery = tokio::select! {
            delivery = consumer.recv() => delivery,
            changed = shutdown.changed() => {
                // a dropped sender also means shutdown
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(stage = processor.name(), "consumer shutting down");
                    return Ok(());
                }
                continue;
            }
        };

        let key = match delivery.key() {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(stage = processor.name(), error = %e, "unroutable delivery dropped");
                delivery.ack();
                continue;
            }
        };
        let message = match delivery.message() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    stage = processor.name(),
                    routing_key = %key,
                    error = %e,
                    "malformed envelope dropped"
                );
                delivery.ack();
                continue;
            }
        };

        // A system-status ping short-circuits any consumer.
        if message.details.api_action == ApiAction::SystemStat
            && delivery.properties().reply_to.is_some()
        {
            let status = SystemStatus::collect(consumer.consumer_tag());
            let reply = status.into_reply(&message);
            if let Err(e) = publisher.rpc_reply(delivery.properties(), &reply) {
                tracing::warn!(stage = processor.name(), error = %e, "system-stat reply failed");
            }
            delivery.ack();
            continue;
        }

        tracing::debug!(
            stage = processor.name(),
            routing_key = %key,
            transaction_id = %message.details.transaction_id,
            sub_id = %message.details.sub_id,
            "processing delivery"
        );

        let inbound = Inbound {
            key: &key,
            message: &message,
            delivery: &delivery,
            publisher: &publisher,
        };
        match processor.process(inbound).await {
            Ok(()) => delivery.ack(),
            Err(ProcessError::Transient(reason)) => {
                tracing::warn!(reason, "transient failure, requeueing with delay");
                delivery.nack_requeue(options.requeue_delay);
            }
            Err(ProcessError::Protocol(reason)) => {
                tracing::error!(reason, "protocol failure, message dropped");
                delivery.ack();
            }
            Err(ProcessError::Fatal(reason)) => {
                tracing::error!(reason, "fatal failure, consumer halting");
                delivery.ack();
                return Ok(());
            }
        }
    }
}
