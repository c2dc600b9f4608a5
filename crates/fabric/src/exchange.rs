//! The topic exchange, its queues and delivery semantics.

use crate::error::{FabricError, FabricResult};
use crate::pattern::BindingPattern;
use nearline_core::routing as rk;
use nearline_core::{Message, RoutingKey, State};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-message properties, carried alongside the payload.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    /// Correlation id echoed by RPC consumers into their reply.
    pub correlation_id: Option<String>,
    /// Queue the RPC reply must be published to.
    pub reply_to: Option<String>,
    /// Set when a delivery is requeued after a missing ack.
    pub redelivered: bool,
}

/// A message sitting on a queue.
#[derive(Clone, Debug)]
struct Envelope {
    routing_key: String,
    payload: Arc<Vec<u8>>,
    properties: Properties,
}

struct QueueState {
    ready: VecDeque<Envelope>,
}

struct Queue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
            }),
            notify: Notify::new(),
        })
    }

    fn enqueue(&self, envelope: Envelope) {
        self.state.lock().unwrap().ready.push_back(envelope);
        self.notify.notify_waiters();
    }

    fn requeue_front(&self, envelope: Envelope) {
        self.state.lock().unwrap().ready.push_front(envelope);
        self.notify.notify_waiters();
    }

    fn depth(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }
}

struct Binding {
    pattern: BindingPattern,
    queue: String,
}

struct ExchangeInner {
    name: String,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    bindings: RwLock<Vec<Binding>>,
    default_prefetch: usize,
    consumer_seq: AtomicUsize,
}

/// The single topic exchange carrying all inter-stage messages.
#[derive(Clone)]
pub struct TopicExchange {
    inner: Arc<ExchangeInner>,
}

impl TopicExchange {
    pub fn new(name: impl Into<String>, default_prefetch: usize) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                name: name.into(),
                queues: RwLock::new(HashMap::new()),
                bindings: RwLock::new(Vec::new()),
                default_prefetch: default_prefetch.max(1),
                consumer_seq: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Declare a queue and bind it with the given patterns.
    pub fn declare_queue(&self, name: &str, bindings: &[&str]) -> FabricResult<()> {
        let parsed = bindings
            .iter()
            .map(|b| BindingPattern::from_str(b))
            .collect::<FabricResult<Vec<_>>>()?;
        {
            let mut queues = self.inner.queues.write().unwrap();
            if queues.contains_key(name) {
                return Err(FabricError::QueueExists(name.to_string()));
            }
            queues.insert(name.to_string(), Queue::new(name.to_string()));
        }
        let mut bound = self.inner.bindings.write().unwrap();
        for pattern in parsed {
            bound.push(Binding {
                pattern,
                queue: name.to_string(),
            });
        }
        Ok(())
    }

    /// Declare an unbound queue, reachable only by direct publication.
    /// RPC reply queues are declared this way.
    pub fn declare_transient_queue(&self, name: &str) -> FabricResult<()> {
        let mut queues = self.inner.queues.write().unwrap();
        if queues.contains_key(name) {
            return Err(FabricError::QueueExists(name.to_string()));
        }
        queues.insert(name.to_string(), Queue::new(name.to_string()));
        Ok(())
    }

    /// Delete a queue and its bindings. Messages still on it are dropped.
    pub fn delete_queue(&self, name: &str) {
        self.inner.queues.write().unwrap().remove(name);
        self.inner
            .bindings
            .write()
            .unwrap()
            .retain(|b| b.queue != name);
    }

    /// Attach a consumer to a queue with the exchange's default prefetch.
    pub fn consumer(&self, queue: &str) -> FabricResult<QueueConsumer> {
        self.consumer_with_prefetch(queue, self.inner.default_prefetch)
    }

    pub fn consumer_with_prefetch(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> FabricResult<QueueConsumer> {
        let queues = self.inner.queues.read().unwrap();
        let queue = queues
            .get(queue)
            .ok_or_else(|| FabricError::QueueNotFound(queue.to_string()))?;
        let seq = self.inner.consumer_seq.fetch_add(1, Ordering::Relaxed);
        Ok(QueueConsumer {
            shared: Arc::new(ConsumerShared {
                queue: queue.clone(),
                tag: format!("{}-{}", queue.name, seq),
                in_flight: AtomicUsize::new(0),
                prefetch: prefetch.max(1),
            }),
        })
    }

    /// Messages waiting (not in flight) on a queue.
    pub fn queue_depth(&self, queue: &str) -> FabricResult<usize> {
        let queues = self.inner.queues.read().unwrap();
        queues
            .get(queue)
            .map(|q| q.depth())
            .ok_or_else(|| FabricError::QueueNotFound(queue.to_string()))
    }

    /// Publish a message, routing immediately.
    pub fn publish(&self, key: &RoutingKey, message: &Message) -> FabricResult<()> {
        self.publish_with(key, message, Properties::default(), Duration::ZERO)
    }

    /// Publish with a delay: the message is held at least `delay` before it
    /// is routed to matching queues.
    pub fn publish_delayed(
        &self,
        key: &RoutingKey,
        message: &Message,
        delay: Duration,
    ) -> FabricResult<()> {
        self.publish_with(key, message, Properties::default(), delay)
    }

    pub fn publish_with(
        &self,
        key: &RoutingKey,
        message: &Message,
        properties: Properties,
        delay: Duration,
    ) -> FabricResult<()> {
        let envelope = Envelope {
            routing_key: key.to_string(),
            payload: Arc::new(message.to_bytes()?),
            properties,
        };
        if delay.is_zero() {
            self.route(envelope);
        } else {
            let exchange = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                exchange.route(envelope);
            });
        }
        Ok(())
    }

    /// Publish directly to a named queue, bypassing topic routing. This is
    /// how RPC replies reach their reply queue.
    pub fn publish_to_queue(
        &self,
        queue: &str,
        message: &Message,
        properties: Properties,
    ) -> FabricResult<()> {
        let payload = Arc::new(message.to_bytes()?);
        let queues = self.inner.queues.read().unwrap();
        let queue_ref = queues
            .get(queue)
            .ok_or_else(|| FabricError::QueueNotFound(queue.to_string()))?;
        queue_ref.enqueue(Envelope {
            routing_key: format!("{}.reply.direct", self.inner.name),
            payload,
            properties,
        });
        Ok(())
    }

    fn route(&self, envelope: Envelope) {
        let bindings = self.inner.bindings.read().unwrap();
        let queues = self.inner.queues.read().unwrap();
        let mut routed = false;
        for binding in bindings.iter() {
            if binding.pattern.matches(&envelope.routing_key) {
                if let Some(queue) = queues.get(&binding.queue) {
                    queue.enqueue(envelope.clone());
                    routed = true;
                }
            }
        }
        if !routed {
            tracing::warn!(
                exchange = %self.inner.name,
                routing_key = %envelope.routing_key,
                "message matched no queue binding, dropped"
            );
        }
    }
}

struct ConsumerShared {
    queue: Arc<Queue>,
    tag: String,
    in_flight: AtomicUsize,
    prefetch: usize,
}

/// A consumer attached to one queue. At most `prefetch` deliveries are
/// outstanding (received but unacked) at a time.
pub struct QueueConsumer {
    shared: Arc<ConsumerShared>,
}

impl QueueConsumer {
    pub fn consumer_tag(&self) -> &str {
        &self.shared.tag
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.queue.name
    }

    /// Wait for the next delivery, respecting the prefetch limit.
    pub async fn recv(&self) -> Delivery {
        loop {
            let notified = self.shared.queue.notify.notified();
            tokio::pin!(notified);
            // register interest before inspecting the queue so an enqueue
            // racing with the check cannot be missed
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::Acquire) < self.shared.prefetch {
                let envelope = self.shared.queue.state.lock().unwrap().ready.pop_front();
                if let Some(envelope) = envelope {
                    self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
                    return Delivery {
                        envelope: Some(envelope),
                        shared: self.shared.clone(),
                    };
                }
            }
            notified.await;
        }
    }
}

/// A single received message. Dropping a delivery without acking requeues it
/// at the front of its queue with the redelivered flag set, so a consumer
/// crash before ack loses nothing.
pub struct Delivery {
    envelope: Option<Envelope>,
    shared: Arc<ConsumerShared>,
}

impl Delivery {
    pub fn routing_key(&self) -> &str {
        &self.envelope.as_ref().unwrap().routing_key
    }

    /// The routing key parsed into its three segments.
    pub fn key(&self) -> FabricResult<RoutingKey> {
        Ok(RoutingKey::from_str(self.routing_key())?)
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.as_ref().unwrap().payload
    }

    pub fn message(&self) -> FabricResult<Message> {
        Ok(Message::from_bytes(self.payload())?)
    }

    pub fn properties(&self) -> &Properties {
        &self.envelope.as_ref().unwrap().properties
    }

    pub fn redelivered(&self) -> bool {
        self.properties().redelivered
    }

    /// Acknowledge: the message is removed for good.
    pub fn ack(mut self) {
        self.envelope = None;
    }

    /// Reject and requeue after a delay, releasing this consumer's prefetch
    /// slot immediately.
    pub fn nack_requeue(mut self, delay: Duration) {
        if let Some(mut envelope) = self.envelope.take() {
            envelope.properties.redelivered = true;
            let queue = self.shared.queue.clone();
            if delay.is_zero() {
                queue.enqueue(envelope);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(envelope);
                });
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(mut envelope) = self.envelope.take() {
            envelope.properties.redelivered = true;
            self.shared.queue.requeue_front(envelope);
        }
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.shared.queue.notify.notify_waiters();
    }
}

/// Publishing helper shared by every worker: routes workflow messages and
/// mirrors each state change to the monitor.
#[derive(Clone)]
pub struct Publisher {
    exchange: TopicExchange,
}

impl Publisher {
    pub fn new(exchange: TopicExchange) -> Self {
        Self { exchange }
    }

    pub fn exchange(&self) -> &TopicExchange {
        &self.exchange
    }

    pub fn publish(&self, key: &RoutingKey, message: &Message) -> FabricResult<()> {
        tracing::debug!(routing_key = %key, sub_id = %message.details.sub_id, "publish");
        self.exchange.publish(key, message)
    }

    pub fn publish_delayed(
        &self,
        key: &RoutingKey,
        message: &Message,
        delay: Duration,
    ) -> FabricResult<()> {
        tracing::debug!(routing_key = %key, delay_ms = delay.as_millis() as u64, "publish delayed");
        self.exchange.publish_delayed(key, message, delay)
    }

    /// Report a sub-transaction state to the monitor, preserving the caller's
    /// application segment. The filelist travels along so failed files reach
    /// the failure log.
    pub fn notify_monitor(
        &self,
        origin: &RoutingKey,
        message: &Message,
        state: State,
    ) -> FabricResult<()> {
        let mut update = message.clone();
        update.details.state = Some(state);
        let key = origin.reply(rk::MONITOR_PUT, rk::START);
        self.exchange.publish(&key, &update)
    }

    /// Publish a filelist onward and mirror the state change to the monitor.
    /// `details` and `meta` are carried verbatim from `base`; the key is
    /// `{origin.application}.{worker}.{state_segment}`.
    pub fn send_pathlist(
        &self,
        origin: &RoutingKey,
        base: &Message,
        filelist: Vec<nearline_core::PathDetails>,
        worker: &str,
        state_segment: &str,
        monitor_state: State,
    ) -> FabricResult<()> {
        let message = base.reply_with(filelist);
        let key = origin.reply(worker, state_segment);
        self.publish(&key, &message)?;
        self.notify_monitor(origin, &message, monitor_state)
    }

    /// As [`send_pathlist`](Self::send_pathlist), with the onward publication
    /// delayed for retry back-off. The monitor update is immediate.
    pub fn send_pathlist_delayed(
        &self,
        origin: &RoutingKey,
        base: &Message,
        filelist: Vec<nearline_core::PathDetails>,
        worker: &str,
        state_segment: &str,
        monitor_state: State,
        delay: Duration,
    ) -> FabricResult<()> {
        let message = base.reply_with(filelist);
        let key = origin.reply(worker, state_segment);
        self.publish_delayed(&key, &message, delay)?;
        self.notify_monitor(origin, &message, monitor_state)
    }

    /// Publish an RPC reply to the requester's reply queue, echoing its
    /// correlation id.
    pub fn rpc_reply(&self, request: &Properties, message: &Message) -> FabricResult<()> {
        let reply_to = request
            .reply_to
            .as_deref()
            .ok_or(FabricError::NoReplyTo)?;
        self.exchange.publish_to_queue(
            reply_to,
            message,
            Properties {
                correlation_id: request.correlation_id.clone(),
                reply_to: None,
                redelivered: false,
            },
        )
    }
}
