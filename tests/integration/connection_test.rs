// Tests against a live broker. Ignored by default; run with
// `cargo test -- --ignored` once a broker is listening on localhost:5672.

use std::path::Path;
use std::time::Duration;

use amqp_queue::config::{load_config_from, QueueConfig};
use amqp_queue::rabbitmq::{QueueClient, QueueError, ReceiveOptions};
use amqp_queue::ReceiveOutcome;

fn load_test_config() -> QueueConfig {
    load_config_from(Path::new("tests/fixtures/configs/test_config.json"))
        .expect("Failed to read test config file")
}

fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let mut client = QueueClient::open(load_test_config()).await.unwrap();
    assert!(client.is_open());
    client.close().await;
    assert!(!client.is_open());
}

#[tokio::test]
#[ignore]
async fn test_wrong_credentials_fail_with_connection_error() {
    let config = QueueConfig {
        pass: "definitely-wrong".to_string(),
        ..load_test_config()
    };
    assert!(matches!(
        QueueClient::open(config).await,
        Err(QueueError::ConnectionError(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_orders_round_trip() {
    let queue = unique_queue("orders");
    let mut client = QueueClient::open(load_test_config()).await.unwrap();
    client.create(&queue).await.unwrap();

    let sent = client.send("order-1", &queue).await.unwrap();
    let options = ReceiveOptions::new().timeout(Duration::from_secs(5));
    let received: Vec<_> = client.receive(&queue, options).await.unwrap().into_iter().collect();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].md5, sent.md5);
    assert!(received[0].is_intact());

    assert!(client.delete_message(&received[0]).await.unwrap());
    assert!(matches!(
        client.delete_message(&received[0]).await,
        Err(QueueError::AckError(_))
    ));

    client.send("quit", &queue).await.unwrap();
    let options = ReceiveOptions::new()
        .max_messages(10)
        .timeout(Duration::from_secs(5));
    let set = client.receive(&queue, options).await.unwrap();
    assert_eq!(set.outcome(), ReceiveOutcome::QuitRequested);
    for message in set {
        client.delete_message(&message).await.unwrap();
    }

    assert!(client.delete(&queue).await.unwrap());
    client.close().await;
}

#[tokio::test]
#[ignore]
async fn test_missing_queue_probes_keep_the_session_usable() {
    let queue = unique_queue("probe");
    let mut client = QueueClient::open(load_test_config()).await.unwrap();

    // a passive declare of a missing queue must not poison the channel
    assert!(!client.delete(&queue).await.unwrap());
    assert!(!client.reconcile(&queue).await.unwrap());

    client.create(&queue).await.unwrap();
    assert!(client.reconcile(&queue).await.unwrap());
    assert!(client.delete(&queue).await.unwrap());
    client.close().await;
}

#[tokio::test]
#[ignore]
async fn test_redeclare_mismatch_then_recover() {
    let queue = unique_queue("mismatch");
    let mut client = QueueClient::open(load_test_config()).await.unwrap();
    client.create_with(&queue, true).await.unwrap();

    let err = client.create_with(&queue, false).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(406));

    // the broker closed the channel; the next call runs on a fresh one
    assert!(client.delete(&queue).await.unwrap());
    client.close().await;
}
