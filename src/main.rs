use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use amqp_queue::config::load_config;
use amqp_queue::rabbitmq::{Broker, MemoryBroker, QueueClient, ReceiveOptions};
use amqp_queue::telemetry::init_tracing;
use amqp_queue::ReceiveOutcome;

const DEMO_QUEUE: &str = "orders";

#[tokio::main]
async fn main() -> Result<()> {
    let in_memory = std::env::args().skip(1).any(|arg| arg == "--memory");

    let config = load_config().context("Failed to load configuration")?;
    init_tracing(config.debug);
    info!(config = ?config, "Configuration loaded");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
            on_signal.cancel();
        }
    });

    if in_memory {
        info!("Using the in-process broker");
        let server = MemoryBroker::new();
        let mut client = QueueClient::with_broker(server.channel(), config)?;
        run_orders(&mut client, shutdown).await
    } else {
        info!(addr = %config.display_addr(), "Connecting to broker");
        let mut client = QueueClient::open(config)
            .await
            .context("Failed to connect to the broker")?;
        run_orders(&mut client, shutdown).await
    }
}

/// Creates a queue, sends a few orders, consumes them until the quit
/// message arrives and removes the queue again.
async fn run_orders<B: Broker>(client: &mut QueueClient<B>, shutdown: CancellationToken) -> Result<()> {
    client.create(DEMO_QUEUE).await?;

    for order in ["order-1", "order-2", "order-3"] {
        let sent = client.send(order, DEMO_QUEUE).await?;
        info!(message_id = %sent.message_id, md5 = %sent.md5, "Order sent");
    }
    client.send("quit", DEMO_QUEUE).await?;

    let options = ReceiveOptions::new()
        .max_messages(10)
        .timeout(Duration::from_secs(5))
        .cancel_on(shutdown);
    let batch = client.receive(DEMO_QUEUE, options).await?;
    let outcome = batch.outcome();

    for message in batch {
        if !message.is_intact() {
            warn!(delivery = %message.handle, "Order arrived corrupted");
        }
        info!(
            body = message.body_text().unwrap_or("<binary>"),
            redelivered = message.redelivered,
            "Order received"
        );
        client.delete_message(&message).await?;
    }

    if outcome != ReceiveOutcome::QuitRequested {
        warn!(outcome = ?outcome, "Stopped before the quit message arrived");
    }

    let deleted = client.delete(DEMO_QUEUE).await?;
    info!(queue = DEMO_QUEUE, deleted, "Demo finished");
    client.close().await;
    Ok(())
}
