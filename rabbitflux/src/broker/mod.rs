//! Broker primitives the service engine is built on.
//!
//! [`Broker`] is an open connection, [`BrokerChannel`] a channel on it. Two
//! implementations exist: [`AmqpBroker`] talks to RabbitMQ through lapin and
//! [`MemoryBroker`] routes messages inside the process with the same semantics.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Envelope;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Name of the nameless default exchange that routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// Queue declaration flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart
    pub durable: bool,
    /// Only the declaring channel may use it; removed when that channel closes
    pub exclusive: bool,
    /// Removed once its last consumer is cancelled
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self { durable: true, ..Self::default() }
    }

    pub fn private() -> Self {
        Self { exclusive: true, auto_delete: true, ..Self::default() }
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject the message
    pub delivery_tag: u64,
    /// Set when the message was requeued and is being delivered again
    pub redelivered: bool,
    pub envelope: Envelope,
}

/// What the broker did with a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// At least one queue accepted it (or it was unroutable and not mandatory)
    Routed,
    /// Mandatory message with no queue bound to its routing key
    Returned,
}

/// Deliveries of one consumer; ends when the consumer is cancelled or its channel closes
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// An open broker connection
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Close the connection and every channel on it
    async fn close(&self) -> Result<()>;

    /// Check if the connection is still usable
    fn is_connected(&self) -> bool;
}

/// A channel: the unit that declares topology, consumes and publishes
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries outstanding on this channel (0 = unlimited)
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Declare a durable topic exchange
    async fn declare_topic_exchange(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Subscribe to a queue. With `no_ack` deliveries count as acknowledged on send.
    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream>;

    /// Stop a consumer; its stream ends and no further messages are delivered to it
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publish and wait until the broker has decided where the message goes
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<PublishOutcome>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge; with `requeue` the broker delivers the message again
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
