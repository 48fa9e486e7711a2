// src/rabbitmq/amqp_client.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortString};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerDelivery, BrokerResult, DeliveryStream, MessageProperties};
use super::errors::{BrokerError, BrokerErrorKind};
use crate::config::QueueConfig;

const CONTENT_MD5_HEADER: &str = "content-md5";
const REPLY_SUCCESS: u16 = 200;

/// [`Broker`] over one lapin connection and one channel.
///
/// A channel closed by a broker-side error (404, 406, ...) is replaced on the
/// next call, bumping [`Broker::generation`]. Probes that are expected to
/// fail run on a short-lived side channel so they never cost the main one.
pub struct LapinBroker {
    connection: Connection,
    channel: Mutex<Channel>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl LapinBroker {
    /// Connects and opens the session channel, bounded by the configured
    /// connection timeout.
    pub async fn connect(config: &QueueConfig) -> BrokerResult<Self> {
        info!(addr = %config.display_addr(), "Connecting to AMQP broker");

        let connection = tokio::time::timeout(
            config.connect_timeout(),
            Connection::connect_uri(config.to_amqp_uri(), ConnectionProperties::default()),
        )
        .await??;

        let channel = open_channel(&connection).await?;
        info!(channel_id = channel.id(), "AMQP session established");

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Current session channel, reopened if the broker closed it.
    async fn channel(&self) -> BrokerResult<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::channel_closed());
        }

        let mut guard = self.channel.lock().await;
        if !guard.status().connected() {
            if !self.connection.status().connected() {
                return Err(BrokerError::new(
                    BrokerErrorKind::ConnectionClosed,
                    "connection is no longer open",
                ));
            }
            warn!(channel_id = guard.id(), "AMQP channel closed by broker, reopening");
            *guard = open_channel(&self.connection).await?;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(guard.clone())
    }

    async fn side_channel(&self) -> BrokerResult<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::channel_closed());
        }
        Ok(self.connection.create_channel().await?)
    }
}

async fn open_channel(connection: &Connection) -> BrokerResult<Channel> {
    let channel = connection.create_channel().await?;
    // publisher confirms so a broker nack surfaces as a publish error
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

async fn close_side_channel(channel: Channel) {
    if channel.status().connected() {
        if let Err(e) = channel.close(REPLY_SUCCESS, "probe done").await {
            debug!("Failed to close side channel: {}", e);
        }
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(md5) = &properties.content_md5 {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(CONTENT_MD5_HEADER),
            AMQPValue::LongString(LongString::from(md5.clone())),
        );
        basic = basic.with_headers(headers);
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let content_md5 = basic.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == CONTENT_MD5_HEADER)
            .and_then(|(_, value)| match value {
                AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
                _ => None,
            })
    });

    MessageProperties {
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        content_md5,
        persistent: *basic.delivery_mode() == Some(2),
        timestamp: *basic.timestamp(),
    }
}

fn to_delivery(delivery: Delivery, consumer_tag: &str) -> BrokerDelivery {
    BrokerDelivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> BrokerResult<bool> {
        // A passive declare of a missing queue is a 404 that closes the channel.
        let probe = self.side_channel().await?;
        let result = probe
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        close_side_channel(probe).await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = BrokerError::from(e);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn declare_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> BrokerResult<bool> {
        if !if_unused {
            let channel = self.channel().await?;
            channel
                .exchange_delete(name, ExchangeDeleteOptions::default())
                .await?;
            return Ok(true);
        }

        // An in-use exchange is refused with 406, which closes the channel.
        let probe = self.side_channel().await?;
        let result = probe
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused: true,
                    ..ExchangeDeleteOptions::default()
                },
            )
            .await;
        close_side_channel(probe).await;

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                let err = BrokerError::from(e);
                if err.kind == BrokerErrorKind::PreconditionFailed {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<u32> {
        let channel = self.channel().await?;
        let purged = channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(purged)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let channel = self.channel().await?;
        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(BrokerError::new(
                BrokerErrorKind::Protocol,
                format!("broker nacked publish to '{}' with key '{}'", exchange, routing_key),
            ));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream> {
        let channel = self.channel().await?;
        // per-consumer limit, applies to the basic_consume that follows
        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let tag = consumer_tag.to_string();
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|d| to_delivery(d, &tag))
                .map_err(BrokerError::from)
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let channel = self.channel().await?;
        channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.status().connected()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.channel.lock().await;
        if channel.status().connected() {
            channel.close(REPLY_SUCCESS, "Closing channel").await?;
        }
        if self.connection.status().connected() {
            info!("Closing AMQP connection gracefully");
            self.connection.close(REPLY_SUCCESS, "Closing connection").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip_through_basic_properties() {
        let props = MessageProperties {
            message_id: Some("abc123".to_string()),
            content_type: Some("text/plain".to_string()),
            content_md5: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
            persistent: true,
            timestamp: Some(1_700_000_000),
        };

        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(from_basic_properties(&basic), props);
    }

    #[test]
    fn test_missing_headers_leave_md5_empty() {
        let props = from_basic_properties(&BasicProperties::default());
        assert_eq!(props, MessageProperties::default());
    }
}
