//! The message fabric: an in-process topic exchange carrying every
//! inter-stage message.
//!
//! A single exchange routes keys of the form `application.worker.state` to
//! queues bound with `*`/`#` wildcards. Publishers may attach a delay; the
//! exchange holds such messages at least that long before routing, which
//! underpins exponential back-off on retry. Consumers receive deliveries
//! under a per-consumer prefetch limit and must ack; a delivery dropped
//! without ack is redelivered, so a crashed worker loses nothing.
//!
//! A parallel RPC channel layers request/reply on top: a reply queue per
//! call, a correlation id echoed in the reply, and a deadline after which
//! the caller abandons the queue.

pub mod consumer;
pub mod error;
pub mod exchange;
pub mod pattern;
pub mod rpc;
pub mod topology;

pub use consumer::{run_consumer, ConsumerOptions, Inbound, ProcessError, Processor};
pub use error::{FabricError, FabricResult};
pub use exchange::{Delivery, Properties, Publisher, QueueConsumer, TopicExchange};
pub use pattern::BindingPattern;
pub use rpc::{RpcClient, SystemStatus};
