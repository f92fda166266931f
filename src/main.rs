use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use eshop_event_bus::config;
use eshop_event_bus::message::{Disposition, Envelope};
use eshop_event_bus::rabbitmq::{
    Arguments, Consumer, ExchangeOptions, PersistentConnection, Producer, QueueOptions,
};

const CHECKOUT_TOPIC: &str = "checkout";
const ORDERING_CONSUMER: &str = "checkoutconsumer";
const CHECKOUT_ROUTING_KEY: &str = "order.created";

#[derive(Debug, Serialize, Deserialize)]
struct BasketItem {
    sku: String,
    quantity: u32,
    unit_price: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BasketCheckout {
    basket_id: Uuid,
    buyer: String,
    items: Vec<BasketItem>,
    created_at: DateTime<Utc>,
}

impl BasketCheckout {
    fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.unit_price * f64::from(item.quantity))
            .sum()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("init-config") {
        let path = args.next().map_or_else(|| PathBuf::from("EventBus.json"), PathBuf::from);
        return config::create_default_config_file(&path);
    }

    let config = config::load_config().context("Failed to load event bus configuration")?;
    let service = &config.service;

    let connection = PersistentConnection::new(
        Arc::new(config.connector()),
        config.connect_retry_policy(),
    );

    let producer = Producer::new(
        connection.clone(),
        &service.service,
        &service.environment,
        CHECKOUT_TOPIC,
        "topic",
    )?;
    let consumer = Arc::new(
        Consumer::new(
            connection.clone(),
            &service.service,
            &service.environment,
            ORDERING_CONSUMER,
        )?
        .with_retry_policy(config.subscribe_retry_policy()),
    );

    let no_arguments = Arguments::new();
    connection
        .declare_exchange(
            producer.exchange_name(),
            producer.exchange_kind(),
            ExchangeOptions::default(),
            &no_arguments,
        )
        .await
        .context("Failed to declare the checkout exchange")?;
    connection
        .declare_queue(consumer.queue_name(), QueueOptions::default(), &no_arguments)
        .await
        .context("Failed to declare the ordering queue")?;
    connection
        .bind_queue(
            consumer.queue_name(),
            producer.exchange_name(),
            CHECKOUT_ROUTING_KEY,
            &no_arguments,
        )
        .await
        .context("Failed to bind the ordering queue")?;

    let cancellation = CancellationToken::new();
    let on_decode_error = config.consumer.decode_error_disposition;
    let mut subscription = tokio::spawn({
        let consumer = consumer.clone();
        let cancellation = cancellation.clone();
        let prefetch_count = config.consumer.prefetch_count;
        async move {
            consumer
                .subscribe(
                    move |envelope: Envelope| handle_checkout(envelope, on_decode_error),
                    prefetch_count,
                    cancellation,
                )
                .await
        }
    });

    let checkout = BasketCheckout {
        basket_id: Uuid::new_v4(),
        buyer: "alice".to_string(),
        items: vec![BasketItem {
            sku: "X1".to_string(),
            quantity: 2,
            unit_price: 9.5,
        }],
        created_at: Utc::now(),
    };
    producer
        .publish_json(CHECKOUT_ROUTING_KEY, &checkout)
        .await
        .context("Failed to publish basket checkout")?;
    info!(basket_id = %checkout.basket_id, "Published basket checkout");

    info!("Waiting for messages. Press Ctrl-C to exit");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
            cancellation.cancel();
            match (&mut subscription).await {
                Ok(Err(e)) => error!(error = %e, "Ordering subscription failed"),
                Err(e) => error!(error = %e, "Ordering subscription task failed"),
                Ok(Ok(())) => {}
            }
        }
        finished = &mut subscription => {
            match finished {
                Ok(Err(e)) => error!(error = %e, "Ordering subscription failed"),
                Err(e) => error!(error = %e, "Ordering subscription task failed"),
                Ok(Ok(())) => warn!("Ordering subscription ended"),
            }
        }
    }

    producer.dispose().await;
    consumer.dispose().await;
    connection.dispose().await;
    Ok(())
}

async fn handle_checkout(envelope: Envelope, on_decode_error: Disposition) -> Result<Disposition> {
    let checkout: BasketCheckout = match envelope.deserialize_json() {
        Ok(checkout) => checkout,
        Err(e) => {
            warn!(
                routing_key = envelope.routing_key(),
                error = %e,
                "Could not decode basket checkout"
            );
            return Ok(on_decode_error);
        }
    };

    info!(
        basket_id = %checkout.basket_id,
        buyer = %checkout.buyer,
        items = checkout.items.len(),
        "Creating order for basket {} with total {:.2}",
        checkout.basket_id,
        checkout.total()
    );
    Ok(Disposition::Ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkout_events_are_acked() {
        let checkout = BasketCheckout {
            basket_id: Uuid::new_v4(),
            buyer: "bob".to_string(),
            items: vec![BasketItem {
                sku: "X1".to_string(),
                quantity: 3,
                unit_price: 2.0,
            }],
            created_at: Utc::now(),
        };
        assert_eq!(checkout.total(), 6.0);

        let body = serde_json::to_vec(&checkout).unwrap();
        let envelope = Envelope::new(CHECKOUT_ROUTING_KEY, body, None).unwrap();

        let disposition = handle_checkout(envelope, Disposition::NackDiscard).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn undecodable_bodies_use_the_configured_disposition() {
        let envelope = Envelope::new(CHECKOUT_ROUTING_KEY, b"not json".to_vec(), None).unwrap();

        let disposition = handle_checkout(envelope, Disposition::NackDiscard).await.unwrap();
        assert_eq!(disposition, Disposition::NackDiscard);
    }
}
