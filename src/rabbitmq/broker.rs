// src/rabbitmq/broker.rs
//! Transport seam between the bus client and whatever speaks to the broker.
//!
//! [`PersistentConnection`](super::PersistentConnection), the producer and the
//! consumer only ever see these traits. The lapin-backed implementation lives
//! in `amqp_client`, the in-memory one in `memory`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::errors::{BusError, Result};
use super::topology::ExchangeKind;

/// Extra `x-*` arguments for declarations and bindings
/// (`x-dead-letter-exchange`, `x-message-ttl`, ...).
pub type Arguments = BTreeMap<String, serde_json::Value>;

pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery>>;

/// Called from the transport's own dispatch thread. Must not block.
pub type ConnectionEventSink = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Called when a channel is closed underneath its owner.
pub type ChannelErrorCallback = Box<dyn Fn(BusError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Shutdown(String),
    Blocked(String),
    CallbackError(String),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Shutdown(reason) => write!(f, "shutdown: {}", reason),
            ConnectionEvent::Blocked(reason) => write!(f, "blocked: {}", reason),
            ConnectionEvent::CallbackError(reason) => write!(f, "callback exception: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// The subset of AMQP basic properties the bus reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// One connection attempt. Retrying is the caller's business.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Host name for logging.
    fn endpoint(&self) -> String;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Register for shutdown / blocked / callback-exception notifications.
    fn on_event(&self, sink: ConnectionEventSink);

    async fn close(&self, reply_code: u16, reason: &str) -> Result<()>;
}

/// A single logical channel. Not safe for interleaved use by several callers;
/// owners serialize access.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: &Arguments,
    ) -> Result<QueueInfo>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self, reply_code: u16, reason: &str) -> Result<()>;

    fn on_error(&self, callback: ChannelErrorCallback);
}
