// src/rabbitmq/publisher.rs

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};
use uuid::Uuid;

use super::broker::{Arguments, ExchangeOptions, MessageProperties};
use super::channel_manager::{ChannelManager, DeclareOnce};
use super::connection::PersistentConnection;
use super::errors::Result;
use super::topology::{self, ExchangeKind};
use crate::message::{Envelope, JSON_CONTENT_TYPE};

/// Publishes to one exchange, declaring it on first use.
///
/// Publishes through one producer reach the broker in call order; there is
/// no ordering across producers.
pub struct Producer {
    exchange_name: String,
    exchange_kind: ExchangeKind,
    connection: PersistentConnection,
    exchange_declared: DeclareOnce,
    channels: ChannelManager,
    // The channel is not safe for interleaved publishes.
    publish_lock: AsyncMutex<()>,
}

impl Producer {
    /// `exchange_kind` must be one of `topic`, `direct`, `fanout`, `headers`.
    pub fn new(
        connection: PersistentConnection,
        service: &str,
        environment: &str,
        name: &str,
        exchange_kind: &str,
    ) -> Result<Self> {
        let kind = exchange_kind.parse()?;
        Self::with_kind(connection, service, environment, name, kind)
    }

    pub fn with_kind(
        connection: PersistentConnection,
        service: &str,
        environment: &str,
        name: &str,
        exchange_kind: ExchangeKind,
    ) -> Result<Self> {
        let exchange_name = topology::exchange_name(environment, exchange_kind, service, name)?;
        let channels = ChannelManager::new(connection.clone(), format!("exchange {}", exchange_name));

        Ok(Producer {
            exchange_name,
            exchange_kind,
            connection,
            exchange_declared: DeclareOnce::new(),
            channels,
            publish_lock: AsyncMutex::new(()),
        })
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    pub async fn publish_json<T>(&self, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)?;
        let envelope = Envelope::new(routing_key, body, Some(JSON_CONTENT_TYPE.to_string()))?;
        self.publish_envelope(&envelope).await
    }

    pub async fn publish_string(&self, routing_key: &str, message: &str) -> Result<()> {
        let envelope = Envelope::new(routing_key, message.as_bytes(), None)?;
        self.publish_envelope(&envelope).await
    }

    /// Publishes a prepared envelope as a persistent message.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.declare_exchange().await?;

        let properties = MessageProperties {
            message_id: Some(
                envelope
                    .message_id()
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            content_type: envelope.content_type().map(str::to_string),
            timestamp: Some(
                envelope
                    .creation_time()
                    .unwrap_or_else(chrono::Utc::now)
                    .timestamp()
                    .max(0) as u64,
            ),
            persistent: true,
        };

        let _guard = self.publish_lock.lock().await;
        let channel = self.channels.get_channel(None).await?;

        if let Err(err) = channel
            .publish(
                &self.exchange_name,
                envelope.routing_key(),
                envelope.body(),
                &properties,
            )
            .await
        {
            error!(
                exchange = %self.exchange_name,
                routing_key = envelope.routing_key(),
                error = %err,
                "Failed to publish message"
            );
            if !channel.is_open() {
                self.channels.invalidate();
            }
            return Err(err);
        }

        debug!(
            exchange = %self.exchange_name,
            routing_key = envelope.routing_key(),
            message_id = properties.message_id.as_deref().unwrap_or_default(),
            "Published message to exchange '{}' with routing key '{}'",
            self.exchange_name,
            envelope.routing_key()
        );
        Ok(())
    }

    async fn declare_exchange(&self) -> Result<()> {
        self.exchange_declared
            .run(|| async {
                let options = ExchangeOptions {
                    durable: true,
                    auto_delete: false,
                };
                self.connection
                    .declare_exchange(
                        &self.exchange_name,
                        self.exchange_kind,
                        options,
                        &Arguments::new(),
                    )
                    .await
            })
            .await
    }

    /// Closes the producer's channel. The shared connection stays open.
    pub async fn dispose(&self) {
        self.channels.close("Disposing producer").await;
    }
}
