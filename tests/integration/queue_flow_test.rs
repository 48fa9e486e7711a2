// End-to-end flows through the public API on the in-process broker.

use std::time::Duration;

use amqp_queue::rabbitmq::{Capability, MemoryBroker, QueueClient, QueueError, ReceiveOptions};
use amqp_queue::{QueueConfig, ReceiveOutcome};
use serde::{Deserialize, Serialize};

fn options(max: usize) -> ReceiveOptions {
    ReceiveOptions::new()
        .max_messages(max)
        .timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn test_orders_scenario() {
    let server = MemoryBroker::new();
    let mut client = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();

    client.create("orders").await.unwrap();
    assert!(client.exists("orders"));
    assert_eq!(client.list_queues(), vec!["orders".to_string()]);

    let sent = client.send("order-1", "orders").await.unwrap();
    client.send("quit", "orders").await.unwrap();

    let set = client.receive("orders", options(10)).await.unwrap();
    assert_eq!(set.outcome(), ReceiveOutcome::QuitRequested);
    let messages: Vec<_> = set.into_iter().collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].md5, sent.md5);
    assert!(messages[1].is_quit());

    for message in &messages {
        assert!(client.delete_message(message).await.unwrap());
    }

    assert!(client.delete("orders").await.unwrap());
    assert!(!client.exists("orders"));
    assert!(!server.has_queue("orders"));
    assert!(!server.has_exchange("router"));

    assert!(!client.delete("orders").await.unwrap());
    client.close().await;
}

#[tokio::test]
async fn test_json_orders_between_two_clients() {
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Order {
        order_id: String,
        items: Vec<String>,
        total: f64,
    }

    let server = MemoryBroker::new();
    let mut producer = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();
    let mut consumer = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();
    producer.create("orders").await.unwrap();

    let order = Order {
        order_id: "A-100".to_string(),
        items: vec!["widget".to_string(), "gadget".to_string()],
        total: 42.5,
    };
    producer.send_json(&order, "orders").await.unwrap();

    let message = consumer
        .receive("orders", options(1))
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(message.content_type.as_deref(), Some("application/json"));
    assert_eq!(message.json::<Order>().unwrap(), order);

    // only the receiving session can settle the delivery
    assert!(matches!(
        producer.delete_message(&message).await,
        Err(QueueError::AckError(_))
    ));
    assert!(consumer.delete_message(&message).await.unwrap());
}

#[tokio::test]
async fn test_capabilities_and_count() {
    let server = MemoryBroker::new();
    let client = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();

    let caps = client.capabilities();
    assert_eq!(caps.get(&Capability::Count), Some(&false));
    assert_eq!(caps.get(&Capability::GetQueues), Some(&true));
    assert!(matches!(
        client.count("orders"),
        Err(QueueError::UnsupportedOperationError(_))
    ));
}

#[tokio::test]
async fn test_unacked_messages_return_when_a_client_is_dropped() {
    let server = MemoryBroker::new();
    let mut setup = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();
    setup.create("orders").await.unwrap();
    setup.send("order-1", "orders").await.unwrap();

    {
        let mut crashed = QueueClient::with_broker(server.channel(), QueueConfig::default()).unwrap();
        let set = crashed.receive("orders", options(1)).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(server.unacked_count(), 1);
        // no close(): the client just goes out of scope
    }

    // the close scheduled on drop runs on a spawned task
    for _ in 0..20 {
        if server.ready_count("orders") == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(server.unacked_count(), 0);
    assert_eq!(server.ready_count("orders"), 1);

    let again = setup.receive("orders", options(1)).await.unwrap();
    let message = again.into_iter().next().unwrap();
    assert!(message.redelivered);
    assert_eq!(message.body_text(), Some("order-1"));
}
