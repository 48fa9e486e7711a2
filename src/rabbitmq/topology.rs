// src/rabbitmq/topology.rs
//! Queue lifecycle: each queue is bound to the shared direct exchange with
//! its own name as the routing key.

use tracing::{debug, info, warn};

use super::broker::Broker;
use super::client::QueueClient;
use super::errors::{BrokerError, BrokerErrorKind, QueueError, Result};

/// Longest queue name AMQP accepts (a short string).
const MAX_QUEUE_NAME_LEN: usize = 255;

fn validate_queue_name(name: &str) -> Result<()> {
    let problem = if name.is_empty() {
        "queue name must not be empty"
    } else if name.len() > MAX_QUEUE_NAME_LEN {
        "queue name is longer than 255 bytes"
    } else {
        return Ok(());
    };
    Err(QueueError::topology(
        name,
        BrokerError::new(BrokerErrorKind::InvalidArgument, problem),
    ))
}

impl<B: Broker> QueueClient<B> {
    /// Declares a durable queue and binds it to the shared exchange.
    pub async fn create(&mut self, name: &str) -> Result<()> {
        self.create_with(name, true).await
    }

    /// Declares a queue and binds it to the shared exchange. Repeating the
    /// call with the same arguments is a no-op.
    pub async fn create_with(&mut self, name: &str, durable: bool) -> Result<()> {
        validate_queue_name(name)?;
        let broker = self.session.broker()?;
        let exchange = self.config.exchange.clone();

        broker
            .declare_queue(name, durable)
            .await
            .map_err(|e| QueueError::topology(name, e))?;
        broker
            .declare_exchange(&exchange, true)
            .await
            .map_err(|e| QueueError::topology(name, e))?;
        broker
            .bind_queue(name, &exchange, name)
            .await
            .map_err(|e| QueueError::topology(name, e))?;

        self.known_queues.insert(name.to_string());
        info!(queue = %name, exchange = %exchange, durable, "Queue created");
        Ok(())
    }

    /// Deletes a queue and its messages.
    ///
    /// Returns `Ok(false)` when the broker has no such queue. The shared
    /// exchange goes too once no locally known queue is left and the broker
    /// reports it unused; failing that cleanup is only logged.
    pub async fn delete(&mut self, name: &str) -> Result<bool> {
        validate_queue_name(name)?;
        let broker = self.session.broker()?;
        let exchange = self.config.exchange.clone();

        let present = broker
            .queue_exists(name)
            .await
            .map_err(|e| QueueError::topology(name, e))?;
        if !present {
            self.known_queues.remove(name);
            debug!(queue = %name, "Queue not found on broker, nothing to delete");
            return Ok(false);
        }

        match broker.unbind_queue(name, &exchange, name).await {
            Ok(()) => {}
            // the exchange may already be gone
            Err(e) if e.is_not_found() => {
                debug!(queue = %name, exchange = %exchange, "Exchange missing while unbinding")
            }
            Err(e) => return Err(QueueError::topology(name, e)),
        }

        let purged = broker
            .delete_queue(name)
            .await
            .map_err(|e| QueueError::topology(name, e))?;
        self.known_queues.remove(name);
        info!(queue = %name, purged, "Queue deleted");

        if self.known_queues.is_empty() {
            match broker.delete_exchange(&exchange, true).await {
                Ok(true) => info!(exchange = %exchange, "Exchange deleted"),
                Ok(false) => debug!(exchange = %exchange, "Exchange still in use, kept"),
                Err(e) => warn!(exchange = %exchange, error = %e, "Failed to delete exchange"),
            }
        }
        Ok(true)
    }

    /// Whether this client created `name` and has not deleted it since.
    /// Answers from the local cache; see [`reconcile`](Self::reconcile) for
    /// the broker's view.
    pub fn exists(&self, name: &str) -> bool {
        self.known_queues.contains(name)
    }

    /// Queues known to this client, sorted.
    pub fn list_queues(&self) -> Vec<String> {
        self.known_queues.iter().cloned().collect()
    }

    /// Asks the broker whether `name` exists and updates the local cache to
    /// match.
    pub async fn reconcile(&mut self, name: &str) -> Result<bool> {
        validate_queue_name(name)?;
        let broker = self.session.broker()?;
        let present = broker
            .queue_exists(name)
            .await
            .map_err(|e| QueueError::topology(name, e))?;

        if present {
            self.known_queues.insert(name.to_string());
        } else {
            self.known_queues.remove(name);
        }
        Ok(present)
    }

    /// Not available over plain AMQP 0-9-1.
    pub fn count(&self, _queue: &str) -> Result<u64> {
        Err(QueueError::UnsupportedOperationError("count"))
    }
}
