use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use uuid::Uuid;

use super::amqp_client::LapinBroker;
use super::broker::Broker;
use super::connection::Session;
use super::errors::Result;
use crate::config::QueueConfig;

/// Operations a generic caller may ask about before calling them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Create,
    Delete,
    Send,
    Receive,
    DeleteMessage,
    GetQueues,
    Count,
    IsExists,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Create => "create",
            Capability::Delete => "delete",
            Capability::Send => "send",
            Capability::Receive => "receive",
            Capability::DeleteMessage => "deleteMessage",
            Capability::GetQueues => "getQueues",
            Capability::Count => "count",
            Capability::IsExists => "isExists",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What this adapter supports. Everything except `count`.
pub fn capabilities() -> BTreeMap<Capability, bool> {
    BTreeMap::from([
        (Capability::Create, true),
        (Capability::Delete, true),
        (Capability::Send, true),
        (Capability::Receive, true),
        (Capability::DeleteMessage, true),
        (Capability::GetQueues, true),
        (Capability::Count, false),
        (Capability::IsExists, true),
    ])
}

/// Consumer lifecycle of a client; a `receive` call moves it to `Consuming`
/// and back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
}

/// Queue client over a single broker session.
///
/// Operations that touch the channel take `&mut self`, so one client is
/// driven by one task at a time. Wrap it in a `tokio::sync::Mutex` to share.
pub struct QueueClient<B: Broker = LapinBroker> {
    pub(crate) session: Session<B>,
    pub(crate) config: QueueConfig,
    /// Local cache of queues created through this client.
    pub(crate) known_queues: BTreeSet<String>,
    /// Unacknowledged deliveries as (channel generation, delivery tag).
    pub(crate) pending: HashSet<(u64, u64)>,
    pub(crate) state: ConsumerState,
}

impl QueueClient<LapinBroker> {
    /// Connects to the broker described by `config`.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        let session = Session::open(&config).await?;
        Ok(Self::from_session(session, config))
    }
}

impl<B: Broker> QueueClient<B> {
    /// Builds a client over an already connected broker.
    pub fn with_broker(broker: B, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_session(Session::with_broker(broker), config))
    }

    fn from_session(session: Session<B>, config: QueueConfig) -> Self {
        Self {
            session,
            config,
            known_queues: BTreeSet::new(),
            pending: HashSet::new(),
            state: ConsumerState::Idle,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.state
    }

    /// Deliveries received but not yet acknowledged or released.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn capabilities(&self) -> BTreeMap<Capability, bool> {
        capabilities()
    }

    pub fn is_supported(&self, capability: Capability) -> bool {
        capabilities().get(&capability).copied().unwrap_or(false)
    }

    /// Ends the session. Outstanding deliveries are returned to the queue by
    /// the broker and their handles stop being valid.
    pub async fn close(&mut self) {
        self.pending.clear();
        self.session.close().await;
    }
}
