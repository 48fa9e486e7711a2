// src/rabbitmq/publisher.rs

use serde::Serialize;
use tracing::{debug, info};

use super::broker::{Broker, MessageProperties};
use super::client::QueueClient;
use super::errors::{QueueError, Result};
use crate::message::{to_json_body, Body, OutboundMessage, CONTENT_TYPE_JSON};

/// Bytes of body shown in debug previews.
const PREVIEW_LEN: usize = 64;

impl<B: Broker> QueueClient<B> {
    /// Publishes `body` to `queue` through the shared exchange and waits for
    /// the broker to confirm it.
    ///
    /// Text bodies are trimmed of surrounding whitespace; byte bodies are
    /// sent untouched.
    pub async fn send(&mut self, body: impl Into<Body>, queue: &str) -> Result<OutboundMessage> {
        let body = body.into();
        let content_type = body.content_type();
        self.publish_bytes(body.normalize(), queue, content_type).await
    }

    /// Serializes `value` with serde_json and publishes it to `queue`.
    pub async fn send_json<T: Serialize>(&mut self, value: &T, queue: &str) -> Result<OutboundMessage> {
        let body = to_json_body(value)?;
        self.publish_bytes(body, queue, CONTENT_TYPE_JSON).await
    }

    async fn publish_bytes(
        &mut self,
        body: Vec<u8>,
        queue: &str,
        content_type: &str,
    ) -> Result<OutboundMessage> {
        let broker = self.session.broker()?;
        let message = OutboundMessage::new(queue, body, content_type);

        let properties = MessageProperties {
            message_id: Some(message.message_id.clone()),
            content_type: Some(message.content_type.clone()),
            content_md5: Some(message.md5.clone()),
            persistent: true,
            timestamp: u64::try_from(message.published_at.timestamp()).ok(),
        };

        if self.config.debug {
            let preview = &message.body[..message.body.len().min(PREVIEW_LEN)];
            debug!(
                queue = %queue,
                message_id = %message.message_id,
                body = %String::from_utf8_lossy(preview),
                "Publishing message"
            );
        }

        broker
            .publish(&self.config.exchange, queue, &message.body, &properties)
            .await
            .map_err(QueueError::publish)?;

        info!(
            queue = %queue,
            message_id = %message.message_id,
            md5 = %message.md5,
            bytes = message.body.len(),
            "Message published"
        );
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::message::md5_hex;
    use crate::rabbitmq::memory::{MemoryBroker, MemoryChannel};
    use serde::Deserialize;

    fn client(server: &MemoryBroker) -> QueueClient<MemoryChannel> {
        let config = QueueConfig {
            debug: true,
            ..QueueConfig::default()
        };
        QueueClient::with_broker(server.channel(), config).unwrap()
    }

    #[tokio::test]
    async fn test_send_routes_to_queue() {
        let server = MemoryBroker::new();
        let mut client = client(&server);
        client.create("orders").await.unwrap();

        let sent = client.send("  order-1 \n", "orders").await.unwrap();
        assert_eq!(sent.body, b"order-1".to_vec());
        assert_eq!(sent.md5, md5_hex(b"order-1"));
        assert_eq!(sent.queue, "orders");
        assert_eq!(server.ready_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_send_json() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Order {
            id: u32,
            item: String,
        }

        let server = MemoryBroker::new();
        let mut client = client(&server);
        client.create("orders").await.unwrap();

        let order = Order {
            id: 7,
            item: "widget".to_string(),
        };
        let sent = client.send_json(&order, "orders").await.unwrap();
        assert_eq!(sent.content_type, CONTENT_TYPE_JSON);
        assert_eq!(serde_json::from_slice::<Order>(&sent.body).unwrap(), order);
    }

    #[tokio::test]
    async fn test_send_without_exchange_is_publish_error() {
        let server = MemoryBroker::new();
        let mut client = client(&server);

        let err = client.send("order-1", "orders").await.unwrap_err();
        assert!(matches!(err, QueueError::PublishError(_)));
        assert_eq!(err.reply_code(), Some(404));
    }

    #[tokio::test]
    async fn test_send_on_closed_session() {
        let server = MemoryBroker::new();
        let mut client = client(&server);
        client.create("orders").await.unwrap();
        client.close().await;

        assert!(matches!(
            client.send("order-1", "orders").await,
            Err(QueueError::ConnectionError(_))
        ));
    }
}
