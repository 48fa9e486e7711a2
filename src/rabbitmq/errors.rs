// src/rabbitmq/errors.rs

use std::fmt;

use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Coarse classification of a broker-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// 404: the named queue or exchange does not exist.
    NotFound,
    /// 403
    AccessRefused,
    /// 405
    ResourceLocked,
    /// 406: e.g. re-declaring a queue with different arguments.
    PreconditionFailed,
    ChannelClosed,
    ConnectionClosed,
    Io,
    Timeout,
    /// Rejected by the client before reaching the broker.
    InvalidArgument,
    Protocol,
    Other,
}

impl BrokerErrorKind {
    /// Maps an AMQP reply code onto a kind.
    pub fn from_reply_code(code: u16) -> Self {
        match code {
            403 => BrokerErrorKind::AccessRefused,
            404 => BrokerErrorKind::NotFound,
            405 => BrokerErrorKind::ResourceLocked,
            406 => BrokerErrorKind::PreconditionFailed,
            320 => BrokerErrorKind::ConnectionClosed,
            _ => BrokerErrorKind::Protocol,
        }
    }
}

/// A failure reported by the broker capability, with the original reply code
/// and text preserved for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub code: Option<u16>,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::from_reply_code(code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn channel_closed() -> Self {
        Self::new(BrokerErrorKind::ChannelClosed, "channel is closed")
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BrokerErrorKind::NotFound
    }

    /// Failures of the connection itself rather than of the method that
    /// happened to be running.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            BrokerErrorKind::ConnectionClosed | BrokerErrorKind::Io | BrokerErrorKind::Timeout
        )
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({:?}, reply code {})", self.message, self.kind, code),
            None => write!(f, "{} ({:?})", self.message, self.kind),
        }
    }
}

impl std::error::Error for BrokerError {}

// Converting from lapin errors
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::ProtocolError(amqp_error) => BrokerError::with_code(
                u16::from(amqp_error.get_id()),
                amqp_error.get_message().as_str(),
            ),
            LapinError::InvalidChannelState(_) => {
                BrokerError::new(BrokerErrorKind::ChannelClosed, error.to_string())
            }
            LapinError::InvalidConnectionState(_) => {
                BrokerError::new(BrokerErrorKind::ConnectionClosed, error.to_string())
            }
            LapinError::IOError(_) => BrokerError::new(BrokerErrorKind::Io, error.to_string()),
            _ => BrokerError::new(BrokerErrorKind::Other, error.to_string()),
        }
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_: Elapsed) -> Self {
        BrokerError::new(BrokerErrorKind::Timeout, "Connection timed out")
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("AMQP connection error: {0}")]
    ConnectionError(#[source] BrokerError),

    #[error("AMQP topology error on queue '{queue}': {source}")]
    TopologyError { queue: String, source: BrokerError },

    #[error("AMQP publish error: {0}")]
    PublishError(#[source] BrokerError),

    #[error("AMQP consume error: {0}")]
    ConsumeError(#[source] BrokerError),

    #[error("AMQP acknowledge error: {0}")]
    AckError(String),

    #[error("{0}() is not supported by this adapter")]
    UnsupportedOperationError(&'static str),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl QueueError {
    pub(crate) fn topology(queue: &str, source: BrokerError) -> Self {
        if source.is_transport() {
            return QueueError::ConnectionError(source);
        }
        QueueError::TopologyError {
            queue: queue.to_string(),
            source,
        }
    }

    pub(crate) fn publish(source: BrokerError) -> Self {
        if source.is_transport() {
            return QueueError::ConnectionError(source);
        }
        QueueError::PublishError(source)
    }

    pub(crate) fn consume(source: BrokerError) -> Self {
        if source.is_transport() {
            return QueueError::ConnectionError(source);
        }
        QueueError::ConsumeError(source)
    }

    pub(crate) fn session_closed() -> Self {
        QueueError::ConnectionError(BrokerError::new(
            BrokerErrorKind::ConnectionClosed,
            "session is closed",
        ))
    }

    /// The wrapped broker error, if this failure came from the broker.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            QueueError::ConnectionError(e)
            | QueueError::PublishError(e)
            | QueueError::ConsumeError(e) => Some(e),
            QueueError::TopologyError { source, .. } => Some(source),
            _ => None,
        }
    }

    /// AMQP reply code of the underlying broker error, when there was one.
    pub fn reply_code(&self) -> Option<u16> {
        self.broker_error().and_then(|e| e.code)
    }
}

// Custom Result type for queue client operations
pub type Result<T> = std::result::Result<T, QueueError>;
