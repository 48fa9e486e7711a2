// src/rabbitmq/memory.rs
//! In-process broker with AMQP-like semantics: durable queues, direct
//! exchanges, per-channel delivery tags, per-consumer prefetch, round-robin
//! between competing consumers and requeue of unacknowledged deliveries when
//! a channel closes.
//!
//! Unlike a real broker, a failed method does not close the channel.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::broker::{Broker, BrokerDelivery, BrokerResult, DeliveryStream, MessageProperties};
use super::errors::{BrokerError, BrokerErrorKind};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct ExchangeState {
    durable: bool,
    /// (routing key, queue)
    bindings: HashSet<(String, String)>,
}

#[derive(Debug)]
struct ConsumerState {
    channel_id: u64,
    tag: String,
    queue: String,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<BrokerDelivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    generation: u64,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Debug, Default)]
struct ServerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    /// Registration order doubles as the round-robin order.
    consumers: Vec<ConsumerState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
}

impl ServerState {
    fn open_channel(&mut self, id: u64) -> BrokerResult<&mut ChannelState> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(BrokerError::channel_closed()),
        }
    }

    fn require_queue(&self, name: &str) -> BrokerResult<()> {
        if self.queues.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::with_code(
                404,
                format!("NOT_FOUND - no queue '{}' in vhost '/'", name),
            ))
        }
    }

    fn require_exchange(&self, name: &str) -> BrokerResult<()> {
        if self.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::with_code(
                404,
                format!("NOT_FOUND - no exchange '{}' in vhost '/'", name),
            ))
        }
    }

    /// Hands ready messages of `queue` to consumers with spare prefetch.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(pos) = self
                .consumers
                .iter()
                .position(|c| c.queue == queue && c.has_capacity())
            else {
                return;
            };
            let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front())
            else {
                return;
            };

            let mut consumer = self.consumers.remove(pos);
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                self.requeue_front(queue, message);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = BrokerDelivery {
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // receiving side is gone; drop the registration
                debug!(consumer_tag = %consumer.tag, "memory_consumer_dropped");
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                continue;
            }

            trace!(queue, delivery_tag, consumer_tag = %consumer.tag, "memory_delivered");
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
            consumer.in_flight += 1;
            self.consumers.push(consumer);
        }
    }

    fn requeue_front(&mut self, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_front(message);
        }
    }

    /// Drops the consumers of a channel and requeues its unacknowledged
    /// deliveries, as a broker does when a channel goes away.
    fn release_channel(&mut self, channel_id: u64) {
        let unacked = match self.channels.get_mut(&channel_id) {
            Some(channel) => std::mem::take(&mut channel.unacked),
            None => return,
        };
        self.consumers.retain(|c| c.channel_id != channel_id);

        // newest first so push_front restores the original order
        let mut touched = HashSet::new();
        for (_, Unacked { queue, mut message, .. }) in unacked.into_iter().rev() {
            message.redelivered = true;
            self.requeue_front(&queue, message);
            touched.insert(queue);
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    /// Returns the queue the delivery came from.
    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> BrokerResult<Unacked> {
        let channel = self.open_channel(channel_id)?;
        let unacked = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            BrokerError::with_code(
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            )
        })?;

        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.channel_id == channel_id && c.tag == unacked.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }
}

/// Handle to an in-process broker. Clones share the same broker state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::new(BrokerErrorKind::Other, "memory broker state poisoned"))
    }

    /// Opens a new channel, the equivalent of connecting a new session.
    pub fn channel(&self) -> MemoryChannel {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..ChannelState::default()
            },
        );
        MemoryChannel {
            id,
            broker: self.clone(),
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().map(|s| s.queues.contains_key(name)).unwrap_or(false)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().map(|s| s.exchanges.contains_key(name)).unwrap_or(false)
    }

    /// Messages waiting in a queue, not counting unacknowledged deliveries.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Unacknowledged deliveries across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock()
            .map(|s| s.channels.values().map(|c| c.unacked.len()).sum())
            .unwrap_or(0)
    }

    /// Replaces channel `id` with a fresh one, the way a client reopens a
    /// channel the broker closed: consumers are dropped, unacknowledged
    /// deliveries are requeued, delivery tags restart and the generation
    /// moves on.
    pub fn reopen_channel(&self, id: u64) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        state.release_channel(id);
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.next_tag = 0;
            channel.generation += 1;
        }
    }

    /// Closes channel `id` from the broker side, as a dropped connection
    /// would. The client holding it is not told.
    pub fn close_channel(&self, id: u64) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.open = false;
        }
        state.release_channel(id);
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .map(|s| s.consumers.iter().filter(|c| c.queue == queue).count())
            .unwrap_or(0)
    }
}

/// One channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Broker for MemoryChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;

        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::with_code(
                406,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}' in vhost '/': received '{}' but current is '{}'",
                    name, durable, existing.durable
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_exists(&self, name: &str) -> BrokerResult<bool> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;
        Ok(state.queues.contains_key(name))
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;

        match state.exchanges.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::with_code(
                406,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}' in vhost '/'",
                    name
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        ..ExchangeState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;
        state.require_queue(queue)?;
        state.require_exchange(exchange)?;

        if let Some(ex) = state.exchanges.get_mut(exchange) {
            ex.bindings.insert((routing_key.to_string(), queue.to_string()));
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;
        state.require_queue(queue)?;
        state.require_exchange(exchange)?;

        if let Some(ex) = state.exchanges.get_mut(exchange) {
            ex.bindings.remove(&(routing_key.to_string(), queue.to_string()));
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> BrokerResult<bool> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;

        let in_use = state
            .exchanges
            .get(name)
            .map_or(false, |ex| !ex.bindings.is_empty());
        if if_unused && in_use {
            return Ok(false);
        }
        state.exchanges.remove(name);
        Ok(true)
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<u32> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;

        let Some(queue) = state.queues.remove(name) else {
            return Ok(0);
        };
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(_, bound)| bound != name);
        }
        // dropping the senders ends the consumers' streams
        state.consumers.retain(|c| c.queue != name);

        Ok(u32::try_from(queue.ready.len()).unwrap_or(u32::MAX))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;

        let targets: Vec<String> = if exchange.is_empty() {
            // default exchange routes by queue name
            state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default()
        } else {
            state.require_exchange(exchange)?;
            state.exchanges[exchange]
                .bindings
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "memory_publish_unroutable");
        }

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;
        state.require_queue(queue)?;

        if state
            .consumers
            .iter()
            .any(|c| c.channel_id == self.id && c.tag == consumer_tag)
        {
            return Err(BrokerError::with_code(
                530,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerState {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            prefetch,
            in_flight: 0,
            tx,
        });
        state.dispatch(queue);

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        state.open_channel(self.id)?;
        state
            .consumers
            .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        let unacked = state.settle(self.id, delivery_tag)?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        let Unacked { queue, mut message, .. } = state.settle(self.id, delivery_tag)?;
        if requeue {
            message.redelivered = true;
            state.requeue_front(&queue, message);
        }
        state.dispatch(&queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .map(|s| s.channels.get(&self.id).map_or(false, |c| c.open))
            .unwrap_or(false)
    }

    fn generation(&self) -> u64 {
        self.broker
            .lock()
            .ok()
            .and_then(|s| s.channels.get(&self.id).map(|c| c.generation))
            .unwrap_or(0)
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.lock()?;
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Ok(());
        };
        if !channel.open {
            return Ok(());
        }
        channel.open = false;
        state.release_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_queue(channel: &MemoryChannel, queue: &str) {
        channel.declare_queue(queue, true).await.unwrap();
        channel.declare_exchange("router", true).await.unwrap();
        channel.bind_queue(queue, "router", queue).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;

        let props = MessageProperties::default();
        channel.publish("router", "orders", b"one", &props).await.unwrap();
        channel.publish("router", "unbound", b"lost", &props).await.unwrap();

        assert_eq!(broker.ready_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_redeclare_with_different_durability_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        channel.declare_queue("orders", true).await.unwrap();
        channel.declare_queue("orders", true).await.unwrap();

        let err = channel.declare_queue("orders", false).await.unwrap_err();
        assert_eq!(err.code, Some(406));
    }

    #[tokio::test]
    async fn test_delivery_tags_are_per_channel_and_ack_once() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;
        channel
            .publish("router", "orders", b"one", &MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.consume("orders", "c1", 0).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_tag, 1);
        assert_eq!(broker.unacked_count(), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        let err = channel.ack(delivery.delivery_tag).await.unwrap_err();
        assert_eq!(err.kind, BrokerErrorKind::PreconditionFailed);

        let other = broker.channel();
        assert!(other.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;
        for body in [b"a", b"b", b"c"] {
            channel
                .publish("router", "orders", body, &MessageProperties::default())
                .await
                .unwrap();
        }

        let mut deliveries = channel.consume("orders", "c1", 1).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.ready_count("orders"), 2);

        channel.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"b".to_vec());
        assert_eq!(broker.ready_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;
        for body in [b"a", b"b"] {
            channel
                .publish("router", "orders", body, &MessageProperties::default())
                .await
                .unwrap();
        }

        let mut deliveries = channel.consume("orders", "c1", 0).await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        deliveries.next().await.unwrap().unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert!(!channel.is_open());
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.ready_count("orders"), 2);

        let fresh = broker.channel();
        let mut again = fresh.consume("orders", "c2", 0).await.unwrap();
        let redelivered = again.next().await.unwrap().unwrap();
        assert_eq!(redelivered.body, b"a".to_vec());
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_reopen_channel_restarts_tags_and_generation() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;
        channel
            .publish("router", "orders", b"a", &MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.consume("orders", "c1", 0).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(channel.generation(), 0);

        broker.reopen_channel(channel.id());
        assert!(channel.is_open());
        assert_eq!(channel.generation(), 1);
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.ready_count("orders"), 1);

        let mut again = channel.consume("orders", "c2", 0).await.unwrap();
        let redelivered = again.next().await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_tag, first.delivery_tag);
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_delete_exchange_if_unused() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;

        assert!(!channel.delete_exchange("router", true).await.unwrap());
        channel.unbind_queue("orders", "router", "orders").await.unwrap();
        assert!(channel.delete_exchange("router", true).await.unwrap());
        assert!(!broker.has_exchange("router"));
    }

    #[tokio::test]
    async fn test_delete_queue_ends_consumers() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        bound_queue(&channel, "orders").await;
        channel
            .publish("router", "orders", b"a", &MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel.consume("orders", "c1", 1).await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        channel
            .publish("router", "orders", b"b", &MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(channel.delete_queue("orders").await.unwrap(), 1);
        assert!(deliveries.next().await.is_none());
        assert_eq!(channel.delete_queue("orders").await.unwrap(), 0);
    }
}
