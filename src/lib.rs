//! Queue client for AMQP 0-9-1 brokers.
//!
//! Queues are bound to one shared direct exchange using the queue name as
//! routing key. Messages are received in bounded batches and acknowledged
//! one by one through their delivery handles.

pub mod config;
pub mod message;
pub mod rabbitmq;
pub mod telemetry;

pub use config::{load_config, QueueConfig};
pub use message::{
    Body, DeliveryHandle, InboundMessage, MessageSet, OutboundMessage, ReceiveOutcome,
    QUIT_SENTINEL,
};
pub use rabbitmq::{
    Broker, Capability, LapinBroker, MemoryBroker, QueueClient, QueueError, ReceiveOptions,
    Result,
};
