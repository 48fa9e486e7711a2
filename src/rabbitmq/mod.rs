// src/rabbitmq/mod.rs
// Queue client over AMQP 0-9-1

pub mod errors;
pub mod broker;
pub mod amqp_client;    // lapin-backed broker
pub mod memory;         // in-process broker
pub mod connection;

// Client operations, split by concern
mod client;
mod topology;
mod publisher;
mod consumer;

pub use amqp_client::LapinBroker;
pub use broker::{Broker, BrokerDelivery, DeliveryStream, MessageProperties};
pub use client::{capabilities, Capability, ConsumerState, QueueClient};
pub use connection::Session;
pub use consumer::ReceiveOptions;
pub use errors::{BrokerError, BrokerErrorKind, QueueError, Result};
pub use memory::{MemoryBroker, MemoryChannel};
