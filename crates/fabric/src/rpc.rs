//! Synchronous request/reply over the fabric.
//!
//! The publisher declares a reply queue, sends the request with a
//! correlation id and the reply queue's name, then blocks up to the
//! configured time limit. Receivers publish the response directly to the
//! reply queue, echoing the correlation id. On timeout the caller abandons
//! and deletes the reply queue.

use crate::error::{FabricError, FabricResult};
use crate::exchange::{Properties, TopicExchange};
use nearline_core::config::RpcConfig;
use nearline_core::{Message, RoutingKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Reply payload for the `system_stat` short-circuit, powering the status
/// dashboard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub hostname: String,
    pub pid: u32,
    pub consumer_tag: String,
    pub timestamp: i64,
}

impl SystemStatus {
    pub fn collect(consumer_tag: &str) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            hostname,
            pid: std::process::id(),
            consumer_tag: consumer_tag.to_string(),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Wrap the status into a reply envelope preserving the request's
    /// correlation details.
    pub fn into_reply(self, request: &Message) -> Message {
        let mut reply = request.reply_with(Vec::new());
        reply.meta = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        reply
    }
}

/// RPC caller side.
#[derive(Clone)]
pub struct RpcClient {
    exchange: TopicExchange,
    time_limit: Duration,
}

impl RpcClient {
    pub fn new(exchange: TopicExchange, config: &RpcConfig) -> Self {
        Self {
            exchange,
            time_limit: config.time_limit(),
        }
    }

    pub fn with_time_limit(exchange: TopicExchange, time_limit: Duration) -> Self {
        Self {
            exchange,
            time_limit,
        }
    }

    /// Publish `request` to `key` and await the correlated reply.
    pub async fn call(&self, key: &RoutingKey, request: &Message) -> FabricResult<Message> {
        let reply_queue = format!("reply-{}", Uuid::new_v4());
        let correlation_id = Uuid::new_v4().to_string();

        self.exchange.declare_transient_queue(&reply_queue)?;
        let result = self
            .call_inner(key, request, &reply_queue, &correlation_id)
            .await;
        self.exchange.delete_queue(&reply_queue);
        result
    }

    async fn call_inner(
        &self,
        key: &RoutingKey,
        request: &Message,
        reply_queue: &str,
        correlation_id: &str,
    ) -> FabricResult<Message> {
        let consumer = self.exchange.consumer(reply_queue)?;
        self.exchange.publish_with(
            key,
            request,
            Properties {
                correlation_id: Some(correlation_id.to_string()),
                reply_to: Some(reply_queue.to_string()),
                redelivered: false,
            },
            Duration::ZERO,
        )?;

        let deadline = tokio::time::Instant::now() + self.time_limit;
        loop {
            let delivery = tokio::time::timeout_at(deadline, consumer.recv())
                .await
                .map_err(|_| FabricError::RpcTimeout(self.time_limit))?;
            // a stale reply from an earlier, abandoned call is discarded
            if delivery.properties().correlation_id.as_deref() == Some(correlation_id) {
                let message = delivery.message()?;
                delivery.ack();
                return Ok(message);
            }
            tracing::debug!(queue = reply_queue, "discarding uncorrelated reply");
            delivery.ack();
        }
    }
}
