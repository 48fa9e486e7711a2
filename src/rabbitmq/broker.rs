// src/rabbitmq/broker.rs
//! The broker capability the queue client is written against.
//!
//! Every primitive maps onto one AMQP 0-9-1 method on a single channel.
//! [`LapinBroker`](super::amqp_client::LapinBroker) talks to a real broker,
//! [`MemoryBroker`](super::memory::MemoryBroker) keeps everything in-process.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::BrokerError;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Stream of deliveries for one consumer registration. Ends once the
/// consumer is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, BrokerResult<BrokerDelivery>>;

/// Message properties the client sets on publish and reads back on delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Hex MD5 of the body, carried in the `content-md5` header.
    pub content_md5: Option<String>,
    pub persistent: bool,
    pub timestamp: Option<u64>,
}

/// One message handed to a consumer by the broker.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    /// Channel-scoped tag required to ack or reject this delivery.
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare a queue. Re-declaring identical topology is a no-op.
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()>;

    /// Ask the broker whether a queue exists without disturbing the session
    /// channel when it does not.
    async fn queue_exists(&self, name: &str) -> BrokerResult<bool>;

    /// Declare a direct exchange.
    async fn declare_exchange(&self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    /// Delete an exchange. With `if_unused` the broker keeps an exchange that
    /// still has bindings and `Ok(false)` is returned.
    async fn delete_exchange(&self, name: &str, if_unused: bool) -> BrokerResult<bool>;

    /// Delete a queue and its messages, returning how many were dropped.
    async fn delete_queue(&self, name: &str) -> BrokerResult<u32>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    /// Register a manual-ack, non-exclusive consumer holding at most
    /// `prefetch` unacknowledged deliveries (0 means unlimited).
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    fn is_open(&self) -> bool;

    /// Bumped whenever the underlying channel is replaced. Delivery tags are
    /// only meaningful on the channel generation that issued them.
    fn generation(&self) -> u64;

    /// Close the channel, then the connection.
    async fn close(&self) -> BrokerResult<()>;
}
