use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::amqp_client::LapinBroker;
use super::broker::Broker;
use super::errors::{QueueError, Result};
use crate::config::QueueConfig;

/// The one connection/channel pair a client talks through.
///
/// No reconnection happens at this layer: once closed, a session stays
/// closed and the caller opens a new one.
pub struct Session<B: Broker> {
    id: Uuid,
    broker: Arc<B>,
    opened_at: DateTime<Utc>,
    open: bool,
}

impl Session<LapinBroker> {
    pub async fn open(config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        let broker = LapinBroker::connect(config)
            .await
            .map_err(QueueError::ConnectionError)?;
        Ok(Self::with_broker(broker))
    }
}

impl<B: Broker> Session<B> {
    /// Wraps an already connected broker.
    pub fn with_broker(broker: B) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            broker: Arc::new(broker),
            opened_at: Utc::now(),
            open: true,
        };
        info!(session_id = %session.id, "Session opened");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.open && self.broker.is_open()
    }

    /// The broker, or `ConnectionError` once the session has been closed.
    pub fn broker(&self) -> Result<Arc<B>> {
        if !self.open {
            return Err(QueueError::session_closed());
        }
        Ok(Arc::clone(&self.broker))
    }

    /// Closes the channel, then the connection. Safe to call repeatedly;
    /// failures are logged, never returned.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        match self.broker.close().await {
            Ok(()) => info!(session_id = %self.id, "Session closed"),
            Err(e) => warn!(session_id = %self.id, error = %e, "Error while closing session"),
        }
    }
}

impl<B: Broker> Drop for Session<B> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let broker = Arc::clone(&self.broker);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = broker.close().await {
                        warn!(session_id = %id, error = %e, "Error while closing dropped session");
                    }
                });
            }
            Err(_) => warn!(
                session_id = %id,
                "Session dropped outside a Tokio runtime; connection not closed gracefully"
            ),
        }
    }
}
