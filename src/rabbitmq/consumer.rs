// src/rabbitmq/consumer.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Fuse, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Broker, BrokerDelivery, BrokerResult, DeliveryStream};
use super::client::{ConsumerState, QueueClient};
use super::errors::{QueueError, Result};
use crate::message::{DeliveryHandle, InboundMessage, MessageSet, ReceiveOutcome};

/// How long to wait for deliveries already in flight once collection stops.
const STRAGGLER_GRACE: Duration = Duration::from_millis(100);

/// Limits for one `receive` call.
#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    /// Stop waiting after this long. `None` waits until `max_messages`
    /// arrive, the consumer ends or `cancel` fires.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            timeout: None,
            cancel: None,
        }
    }
}

impl ReceiveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
}

/// One consumer registration for the span of a `receive` call.
///
/// Dropped before [`finish`](Self::finish) or [`abort`](Self::abort) means
/// the call's future was abandoned: the client goes back to idle at once and
/// a spawned task cancels the consumer and requeues every delivery the call
/// had taken.
struct ActiveConsumer<'a, B: Broker> {
    broker: Arc<B>,
    consumer_tag: String,
    generation: u64,
    deliveries: Fuse<DeliveryStream>,
    /// Still registered with the broker.
    registered: bool,
    /// Delivery tags taken by this call and not yet handed to the caller.
    collected: Vec<u64>,
    pending: &'a mut HashSet<(u64, u64)>,
    state: &'a mut ConsumerState,
    settled: bool,
}

impl<'a, B: Broker> ActiveConsumer<'a, B> {
    fn track(&mut self, delivery_tag: u64) {
        self.pending.insert((self.generation, delivery_tag));
        self.collected.push(delivery_tag);
    }

    /// Cancels the registration unless the broker already ended it.
    async fn stop(&mut self) {
        if !self.registered {
            return;
        }
        cancel_and_drain(
            self.broker.as_ref(),
            &self.consumer_tag,
            self.generation,
            &mut self.deliveries,
        )
        .await;
        self.registered = false;
    }

    /// Hands the collected deliveries over to the caller.
    fn finish(mut self) {
        self.collected.clear();
        self.settled = true;
    }

    /// Puts the collected deliveries back on the queue.
    async fn abort(mut self) {
        for tag in std::mem::take(&mut self.collected) {
            if self.pending.remove(&(self.generation, tag)) {
                requeue(self.broker.as_ref(), self.generation, tag).await;
            }
        }
        self.settled = true;
    }
}

impl<'a, B: Broker> Drop for ActiveConsumer<'a, B> {
    fn drop(&mut self) {
        *self.state = ConsumerState::Idle;
        if self.settled {
            return;
        }

        let collected = std::mem::take(&mut self.collected);
        for tag in &collected {
            self.pending.remove(&(self.generation, *tag));
        }
        if !self.registered && collected.is_empty() {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let consumer_tag = self.consumer_tag.clone();
        let registered = self.registered;
        let generation = self.generation;
        let mut deliveries = std::mem::replace(
            &mut self.deliveries,
            stream::empty::<BrokerResult<BrokerDelivery>>().boxed().fuse(),
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(consumer_tag = %consumer_tag, returned = collected.len(), "Receive abandoned, releasing consumer");
                handle.spawn(async move {
                    if registered {
                        cancel_and_drain(broker.as_ref(), &consumer_tag, generation, &mut deliveries)
                            .await;
                    }
                    for tag in collected {
                        requeue(broker.as_ref(), generation, tag).await;
                    }
                });
            }
            Err(_) => warn!(
                consumer_tag = %consumer_tag,
                "Receive abandoned outside a Tokio runtime; consumer left registered"
            ),
        }
    }
}

/// Cancels a consumer and requeues what the broker pushed before the cancel
/// took effect.
async fn cancel_and_drain<B: Broker>(
    broker: &B,
    consumer_tag: &str,
    generation: u64,
    deliveries: &mut Fuse<DeliveryStream>,
) {
    // a replaced channel took its consumers with it
    if broker.generation() == generation {
        if let Err(e) = broker.cancel(consumer_tag).await {
            warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
        }
    }

    let mut returned = 0usize;
    while let Ok(Some(Ok(delivery))) =
        tokio::time::timeout(STRAGGLER_GRACE, deliveries.next()).await
    {
        requeue(broker, generation, delivery.delivery_tag).await;
        returned += 1;
    }
    if returned > 0 {
        debug!(consumer_tag = %consumer_tag, returned, "Requeued deliveries that arrived after collection stopped");
    }
}

async fn requeue<B: Broker>(broker: &B, generation: u64, delivery_tag: u64) {
    // tags of a replaced channel mean nothing on its successor, and the
    // broker already requeued them when the old channel closed
    if broker.generation() != generation {
        return;
    }
    if let Err(e) = broker.reject(delivery_tag, true).await {
        warn!(delivery_tag, error = %e, "Failed to requeue message");
    }
}

impl<B: Broker> QueueClient<B> {
    /// Collects up to `options.max_messages` deliveries from `queue`.
    ///
    /// A temporary consumer is registered for the call and cancelled before
    /// returning. Every returned message must be settled with
    /// [`delete_message`](Self::delete_message) or
    /// [`release_message`](Self::release_message); unsettled ones go back to
    /// the queue when the session closes.
    ///
    /// Prefer [`ReceiveOptions::cancel_on`] or [`ReceiveOptions::timeout`]
    /// to stop early. Dropping the future also works: the client is idle
    /// again immediately, and the consumer is cancelled and anything it had
    /// taken requeued in the background.
    pub async fn receive(&mut self, queue: &str, options: ReceiveOptions) -> Result<MessageSet> {
        if options.max_messages == 0 {
            return Ok(MessageSet::new(Vec::new(), ReceiveOutcome::Drained));
        }
        let broker = self.session.broker()?;
        let session_id = self.session.id();

        let consumer_tag = format!(
            "{}-{}",
            self.config.consumer_tag,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        // the broker never pushes more than we are willing to keep
        let prefetch = u16::try_from(options.max_messages).unwrap_or(0);

        let deliveries = broker
            .consume(queue, &consumer_tag, prefetch)
            .await
            .map_err(QueueError::consume)?;
        let generation = broker.generation();

        // handles from replaced channels can never be settled
        let before = self.pending.len();
        self.pending.retain(|&(g, _)| g == generation);
        if self.pending.len() < before {
            debug!(dropped = before - self.pending.len(), generation, "Dropped handles of replaced channels");
        }

        info!(queue = %queue, consumer_tag = %consumer_tag, max_messages = options.max_messages, "Consumer started");
        self.state = ConsumerState::Consuming;
        let mut active = ActiveConsumer {
            broker: Arc::clone(&broker),
            consumer_tag: consumer_tag.clone(),
            generation,
            deliveries: deliveries.fuse(),
            registered: true,
            collected: Vec::new(),
            pending: &mut self.pending,
            state: &mut self.state,
            settled: false,
        };

        let ReceiveOptions {
            max_messages,
            timeout,
            cancel,
        } = options;
        let cancel = cancel.unwrap_or_default();
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut messages = Vec::new();
        let outcome: Result<ReceiveOutcome> = loop {
            if messages.len() >= max_messages {
                break Ok(ReceiveOutcome::Drained);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(ReceiveOutcome::Cancelled),
                _ = &mut deadline => break Ok(ReceiveOutcome::TimedOut),
                next = active.deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        active.track(delivery.delivery_tag);
                        let message = inbound(session_id, generation, queue, delivery);
                        if !message.is_intact() {
                            warn!(queue = %queue, delivery_tag = message.handle.delivery_tag(), "Message body does not match its content-md5 header");
                        }
                        debug!(queue = %queue, delivery_tag = message.handle.delivery_tag(), redelivered = message.redelivered, "Message received");

                        let quit = message.is_quit();
                        messages.push(message);
                        if quit {
                            info!(queue = %queue, consumer_tag = %consumer_tag, "Quit message received");
                            break Ok(ReceiveOutcome::QuitRequested);
                        }
                    }
                    Some(Err(e)) => {
                        active.registered = false;
                        break Err(QueueError::consume(e));
                    }
                    None => {
                        active.registered = false;
                        break Ok(ReceiveOutcome::ConsumerClosed);
                    }
                },
            }
        };

        active.stop().await;
        match outcome {
            Ok(outcome) => {
                active.finish();
                info!(queue = %queue, received = messages.len(), outcome = ?outcome, "Consumer stopped");
                Ok(MessageSet::new(messages, outcome))
            }
            Err(e) => {
                // give back what was collected rather than strand it
                active.abort().await;
                Err(e)
            }
        }
    }

    /// Acknowledges a received message, removing it from the queue for good.
    /// A handle can be settled once.
    pub async fn delete_message(&mut self, message: &InboundMessage) -> Result<bool> {
        self.settle(&message.handle, Settlement::Ack).await
    }

    /// Returns a received message to its queue for redelivery.
    pub async fn release_message(&mut self, message: &InboundMessage) -> Result<bool> {
        self.settle(&message.handle, Settlement::Requeue).await
    }

    async fn settle(&mut self, handle: &DeliveryHandle, settlement: Settlement) -> Result<bool> {
        if handle.session_id() != self.session.id() {
            return Err(QueueError::AckError(format!(
                "delivery {} belongs to another session",
                handle
            )));
        }
        let broker = self
            .session
            .broker()
            .map_err(|_| QueueError::AckError(format!("session closed before settling {}", handle)))?;

        let key = (handle.generation(), handle.delivery_tag());
        if handle.generation() != broker.generation() {
            self.pending.remove(&key);
            return Err(QueueError::AckError(format!(
                "delivery {} was received on a channel that has since been replaced",
                handle
            )));
        }
        if !self.pending.remove(&key) {
            return Err(QueueError::AckError(format!(
                "delivery {} is unknown or already settled",
                handle
            )));
        }

        let tag = handle.delivery_tag();
        let result = match settlement {
            Settlement::Ack => broker.ack(tag).await,
            Settlement::Requeue => broker.reject(tag, true).await,
        };
        result.map_err(|e| QueueError::AckError(e.to_string()))?;

        match settlement {
            Settlement::Ack => debug!(delivery_tag = tag, "Message acknowledged"),
            Settlement::Requeue => debug!(delivery_tag = tag, "Message requeued"),
        }
        Ok(true)
    }
}

fn inbound(
    session_id: Uuid,
    generation: u64,
    queue: &str,
    delivery: BrokerDelivery,
) -> InboundMessage {
    let BrokerDelivery {
        delivery_tag,
        redelivered,
        body,
        properties,
        ..
    } = delivery;
    InboundMessage::new(
        DeliveryHandle::new(session_id, generation, delivery_tag),
        queue,
        body,
        properties.message_id,
        properties.content_type,
        properties.content_md5,
        redelivered,
    )
}
