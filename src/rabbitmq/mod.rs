// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: one persistent connection, lazily declared
// topology, producers and consumers with cached channels.

pub mod broker;
pub mod errors;
pub mod memory;
pub mod retry;
pub mod topology;

mod amqp_client;
mod channel_manager;
mod connection;
mod consumer;
mod publisher;

pub use amqp_client::LapinConnector;
pub use broker::{
    Arguments, BrokerChannel, BrokerConnection, ConnectionEvent, Connector, ExchangeOptions,
    IncomingDelivery, MessageProperties, QueueInfo, QueueOptions,
};
pub use connection::PersistentConnection;
pub use consumer::{Consumer, MessageHandler};
pub use errors::{BusError, Result};
pub use memory::InMemoryBroker;
pub use publisher::Producer;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use topology::{exchange_name, queue_name, ExchangeKind};
