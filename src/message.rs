use std::fmt;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// A delivered body equal to this cancels the active consumer.
pub const QUIT_SENTINEL: &[u8] = b"quit";

pub(crate) const CONTENT_TYPE_TEXT: &str = "text/plain";
pub(crate) const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// Lowercase hex MD5 of a body.
pub fn md5_hex(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// A message body before it is published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// Trimmed of surrounding whitespace when normalized.
    Text(String),
    /// Sent untouched.
    Bytes(Vec<u8>),
}

impl Body {
    pub(crate) fn content_type(&self) -> &'static str {
        match self {
            Body::Text(_) => CONTENT_TYPE_TEXT,
            Body::Bytes(_) => CONTENT_TYPE_BINARY,
        }
    }

    /// The bytes that go on the wire.
    pub fn normalize(self) -> Vec<u8> {
        match self {
            Body::Text(text) => text.trim().as_bytes().to_vec(),
            Body::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

/// Record of a published message. There is nothing to acknowledge on the
/// sending side, so it carries no delivery handle.
#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub queue: String,
    pub body: Vec<u8>,
    pub md5: String,
    pub content_type: String,
    pub published_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub(crate) fn new(queue: &str, body: Vec<u8>, content_type: &str) -> Self {
        OutboundMessage {
            message_id: Uuid::new_v4().simple().to_string(),
            queue: queue.to_string(),
            md5: md5_hex(&body),
            body,
            content_type: content_type.to_string(),
            published_at: Utc::now(),
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Token required to acknowledge one delivery: the broker's delivery tag,
/// scoped to the session and channel generation that received it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    session_id: Uuid,
    generation: u64,
    delivery_tag: u64,
}

impl DeliveryHandle {
    pub(crate) fn new(session_id: Uuid, generation: u64, delivery_tag: u64) -> Self {
        Self {
            session_id,
            generation,
            delivery_tag,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.session_id.simple(),
            self.generation,
            self.delivery_tag
        )
    }
}

/// A message received from a queue, pending acknowledgment.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub handle: DeliveryHandle,
    pub queue: String,
    pub body: Vec<u8>,
    /// MD5 of the body as received.
    pub md5: String,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub redelivered: bool,
    sent_md5: Option<String>,
}

impl InboundMessage {
    pub(crate) fn new(
        handle: DeliveryHandle,
        queue: &str,
        body: Vec<u8>,
        message_id: Option<String>,
        content_type: Option<String>,
        sent_md5: Option<String>,
        redelivered: bool,
    ) -> Self {
        InboundMessage {
            handle,
            queue: queue.to_string(),
            md5: md5_hex(&body),
            body,
            message_id,
            content_type,
            redelivered,
            sent_md5,
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// False when the publisher sent a digest that does not match the body.
    pub fn is_intact(&self) -> bool {
        self.sent_md5.as_deref().map_or(true, |sent| sent == self.md5)
    }

    pub fn is_quit(&self) -> bool {
        self.body == QUIT_SENTINEL
    }
}

/// Why a `receive` call stopped collecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// `max_messages` deliveries were collected.
    Drained,
    TimedOut,
    /// The caller's cancellation token fired.
    Cancelled,
    /// A `quit` body cancelled the consumer.
    QuitRequested,
    /// The broker ended the consumer (cancelled elsewhere or channel lost).
    ConsumerClosed,
}

/// The messages returned by one `receive` call. Consumed by iteration.
#[derive(Debug)]
pub struct MessageSet {
    messages: Vec<InboundMessage>,
    outcome: ReceiveOutcome,
}

impl MessageSet {
    pub(crate) fn new(messages: Vec<InboundMessage>, outcome: ReceiveOutcome) -> Self {
        Self { messages, outcome }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn outcome(&self) -> ReceiveOutcome {
        self.outcome
    }
}

impl IntoIterator for MessageSet {
    type Item = InboundMessage;
    type IntoIter = std::vec::IntoIter<InboundMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

pub(crate) fn to_json_body<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}
