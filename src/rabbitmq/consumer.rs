// src/rabbitmq/consumer.rs

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Arguments, BrokerChannel, DeliveryStream, IncomingDelivery, QueueOptions};
use super::channel_manager::{close_quietly, ChannelManager, DeclareOnce};
use super::connection::PersistentConnection;
use super::errors::{BusError, Result};
use super::retry::RetryPolicy;
use super::topology;
use crate::message::{Disposition, Envelope};

/// Application callback invoked once per delivery.
///
/// Any `Fn(Envelope) -> impl Future<Output = anyhow::Result<Disposition>>`
/// closure qualifies. An `Err` or a panic is treated as
/// [`Disposition::NackDiscard`].
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, anyhow::Result<Disposition>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Disposition>> + Send + 'static,
{
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, anyhow::Result<Disposition>> {
        Box::pin(self(envelope))
    }
}

struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    receiver: JoinHandle<()>,
    // Cancelled by unsubscribe().
    stopped: CancellationToken,
    // Cancelled when the delivery stream runs dry.
    ended: CancellationToken,
}

/// Receives from one queue and turns handler verdicts into acknowledgements.
pub struct Consumer {
    queue_name: String,
    consumer_name: String,
    connection: PersistentConnection,
    queue_options: QueueOptions,
    queue_arguments: Arguments,
    retry: RetryPolicy,
    queue_declared: DeclareOnce,
    channels: ChannelManager,
    active: AsyncMutex<()>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Consumer {
    pub fn new(
        connection: PersistentConnection,
        service: &str,
        environment: &str,
        consumer_name: &str,
    ) -> Result<Self> {
        let queue_name = topology::queue_name(environment, service, consumer_name)?;
        let channels = ChannelManager::new(connection.clone(), format!("queue {}", queue_name));

        Ok(Consumer {
            queue_name,
            consumer_name: consumer_name.to_string(),
            connection,
            queue_options: QueueOptions::default(),
            queue_arguments: Arguments::new(),
            retry: RetryPolicy::default(),
            queue_declared: DeclareOnce::new(),
            channels,
            active: AsyncMutex::new(()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Queue flags and arguments, e.g. `x-dead-letter-exchange` so that
    /// discarded messages are dead-lettered instead of dropped.
    pub fn with_queue_options(mut self, options: QueueOptions, arguments: Arguments) -> Self {
        self.queue_options = options;
        self.queue_arguments = arguments;
        self
    }

    /// Retry budget for establishing a subscription.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).keys().cloned().collect()
    }

    /// Consumes until `cancellation` fires or the subscription is removed
    /// with [`Consumer::unsubscribe`].
    ///
    /// Setup is retried with backoff. When the broker side of the
    /// subscription goes away (channel or connection closed) the setup runs
    /// again. Returns an error once the retry budget is spent.
    pub async fn subscribe<H>(
        &self,
        handler: H,
        prefetch_count: u16,
        cancellation: CancellationToken,
    ) -> Result<()>
    where
        H: MessageHandler,
    {
        let _active = self.active.try_lock().map_err(|_| {
            BusError::SubscriptionFailed(format!(
                "Consumer for queue {} already has an active subscription",
                self.queue_name
            ))
        })?;
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let what = format!("Could not subscribe to queue {}", self.queue_name);

        loop {
            let setup = self
                .retry
                .run(&what, || self.start(handler.clone(), prefetch_count));

            let consumer_tag = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    info!(
                        queue = %self.queue_name,
                        "Subscription to queue {} cancelled during setup",
                        self.queue_name
                    );
                    self.abandon_setup().await;
                    return Ok(());
                }
                result = setup => result.map_err(|err| self.setup_failed(err))?,
            };

            let Some((stopped, ended)) = self.signals(&consumer_tag) else {
                return Ok(());
            };

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    info!(
                        queue = %self.queue_name,
                        consumer_tag = %consumer_tag,
                        "Subscription to queue {} cancelled",
                        self.queue_name
                    );
                    self.unsubscribe(&consumer_tag).await;
                    return Ok(());
                }
                _ = stopped.cancelled() => {
                    info!(
                        queue = %self.queue_name,
                        consumer_tag = %consumer_tag,
                        "Consumer {} on queue {} was unsubscribed",
                        consumer_tag,
                        self.queue_name
                    );
                    return Ok(());
                }
                _ = ended.cancelled() => {
                    warn!(
                        queue = %self.queue_name,
                        consumer_tag = %consumer_tag,
                        "Consumer {} on queue {} was cancelled. Re-subscribing...",
                        consumer_tag,
                        self.queue_name
                    );
                    self.unsubscribe(&consumer_tag).await;
                }
            }
        }
    }

    /// Starts consuming without waiting. Returns the consumer tag to pass
    /// to [`Consumer::unsubscribe`].
    pub async fn subscribe_once<H>(&self, handler: H, prefetch_count: u16) -> Result<String>
    where
        H: MessageHandler,
    {
        self.start(Arc::new(handler), prefetch_count).await
    }

    /// Cancels the subscription and closes its channel. Unknown or already
    /// removed tags are ignored.
    pub async fn unsubscribe(&self, consumer_tag: &str) {
        let Some(subscription) = lock(&self.subscriptions).remove(consumer_tag) else {
            debug!(
                queue = %self.queue_name,
                consumer_tag,
                "Consumer is already unsubscribed"
            );
            return;
        };

        subscription.stopped.cancel();
        if subscription.channel.is_open() {
            if let Err(err) = subscription.channel.cancel(consumer_tag).await {
                warn!(consumer_tag, error = %err, "Failed to cancel RabbitMQ consumer");
            }
        }
        subscription.receiver.abort();

        close_quietly(subscription.channel.as_ref(), self.channels.label(), "Unsubscribe").await;
        self.channels.invalidate();

        info!(
            queue = %self.queue_name,
            consumer_tag,
            "Consumer {} unregistered from queue {}",
            consumer_tag,
            self.queue_name
        );
    }

    /// Drops every subscription and closes the channel. Idempotent.
    pub async fn dispose(&self) {
        for consumer_tag in self.active_subscriptions() {
            self.unsubscribe(&consumer_tag).await;
        }
        self.channels.close("Disposing consumer").await;
    }

    async fn declare_queue(&self) -> Result<()> {
        self.queue_declared
            .run(|| async {
                self.connection
                    .declare_queue(&self.queue_name, self.queue_options, &self.queue_arguments)
                    .await
                    .map(|_| ())
            })
            .await
    }

    async fn start(&self, handler: Arc<dyn MessageHandler>, prefetch_count: u16) -> Result<String> {
        if prefetch_count == 0 {
            return Err(BusError::InvalidArgument(
                "prefetch count must be greater than zero".to_string(),
            ));
        }
        if !lock(&self.subscriptions).is_empty() {
            return Err(self.already_active());
        }

        self.declare_queue().await?;
        let channel = self.channels.get_channel(Some(prefetch_count)).await?;

        let consumer_tag = format!("{}-{}", self.consumer_name, Uuid::new_v4().simple());
        let stream = match channel.consume(&self.queue_name, &consumer_tag).await {
            Ok(stream) => stream,
            Err(err) => {
                if !channel.is_open() {
                    self.channels.invalidate();
                }
                return Err(BusError::Channel(format!(
                    "basic.consume on queue {} failed: {}",
                    self.queue_name, err
                )));
            }
        };

        let registered = {
            let mut subscriptions = lock(&self.subscriptions);
            if subscriptions.is_empty() {
                let ended = CancellationToken::new();
                let receiver = tokio::spawn(receive(
                    stream,
                    channel.clone(),
                    handler,
                    self.queue_name.clone(),
                    consumer_tag.clone(),
                    ended.clone(),
                ));
                subscriptions.insert(
                    consumer_tag.clone(),
                    Subscription {
                        channel: channel.clone(),
                        receiver,
                        stopped: CancellationToken::new(),
                        ended,
                    },
                );
                true
            } else {
                false
            }
        };

        if !registered {
            // Lost a race with a concurrent subscribe_once.
            if let Err(err) = channel.cancel(&consumer_tag).await {
                warn!(consumer_tag = %consumer_tag, error = %err, "Failed to cancel RabbitMQ consumer");
            }
            return Err(self.already_active());
        }

        info!(
            queue = %self.queue_name,
            consumer_tag = %consumer_tag,
            prefetch_count,
            "Consumer {} registered on queue {}",
            consumer_tag,
            self.queue_name
        );
        Ok(consumer_tag)
    }

    /// A `basic.consume` cut short may already be registered broker side.
    /// Closing the channel drops it.
    async fn abandon_setup(&self) {
        if lock(&self.subscriptions).is_empty() {
            self.channels.close("Subscription cancelled").await;
        }
    }

    fn signals(&self, consumer_tag: &str) -> Option<(CancellationToken, CancellationToken)> {
        lock(&self.subscriptions)
            .get(consumer_tag)
            .map(|s| (s.stopped.clone(), s.ended.clone()))
    }

    fn already_active(&self) -> BusError {
        BusError::SubscriptionFailed(format!(
            "Consumer for queue {} already has an active subscription",
            self.queue_name
        ))
    }

    fn setup_failed(&self, err: BusError) -> BusError {
        error!(
            queue = %self.queue_name,
            error = %err,
            "Fatal error: could not subscribe to queue {}",
            self.queue_name
        );
        match err {
            BusError::Broker(reason) | BusError::Channel(reason) => BusError::SubscriptionFailed(
                format!("queue {}: {}", self.queue_name, reason),
            ),
            other => other,
        }
    }
}

/// Pulls deliveries off the stream and handles each on its own task, so a
/// slow handler only holds back its own acknowledgement.
async fn receive(
    mut stream: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn MessageHandler>,
    queue: String,
    consumer_tag: String,
    ended: CancellationToken,
) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(delivery) => {
                tokio::spawn(handle_delivery(channel.clone(), handler.clone(), delivery));
            }
            Err(err) => {
                error!(queue = %queue, consumer_tag = %consumer_tag, error = %err, "Error receiving delivery");
                break;
            }
        }
    }

    debug!(queue = %queue, consumer_tag = %consumer_tag, "Delivery stream closed");
    ended.cancel();
}

async fn handle_delivery(
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn MessageHandler>,
    delivery: IncomingDelivery,
) {
    let delivery_tag = delivery.delivery_tag;
    let envelope = Envelope::from_delivery(delivery);
    let routing_key = envelope.routing_key().to_string();

    let outcome = AssertUnwindSafe(async move { handler.handle(envelope).await })
        .catch_unwind()
        .await;

    let disposition = match outcome {
        Ok(Ok(disposition)) => disposition,
        Ok(Err(err)) => {
            let failure = BusError::HandlerFailure(format!("{:#}", err));
            if matches!(err.downcast_ref::<BusError>(), Some(BusError::InvalidDisposition(_))) {
                error!(
                    delivery_tag,
                    routing_key = %routing_key,
                    error = %failure,
                    "Fatal: handler produced an invalid disposition; discarding message"
                );
            } else {
                warn!(
                    delivery_tag,
                    routing_key = %routing_key,
                    error = %failure,
                    "Handler failed; discarding message"
                );
            }
            Disposition::NackDiscard
        }
        Err(panic) => {
            error!(
                delivery_tag,
                routing_key = %routing_key,
                panic = %panic_message(panic.as_ref()),
                "Handler panicked; discarding message"
            );
            Disposition::NackDiscard
        }
    };

    if let Err(err) = acknowledge(channel.as_ref(), delivery_tag, disposition).await {
        error!(delivery_tag, ?disposition, error = %err, "Failed to acknowledge delivery");
    }
}

async fn acknowledge(
    channel: &dyn BrokerChannel,
    delivery_tag: u64,
    disposition: Disposition,
) -> Result<()> {
    match disposition {
        Disposition::Ack => channel.ack(delivery_tag).await,
        Disposition::NackDiscard => channel.nack(delivery_tag, false).await,
        Disposition::NackRequeue => channel.nack(delivery_tag, true).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::broker::MessageProperties;
    use crate::rabbitmq::memory::{AckKind, InMemoryBroker};

    async fn channel_with_delivery(broker: &InMemoryBroker) -> (Arc<dyn BrokerChannel>, IncomingDelivery) {
        use crate::rabbitmq::broker::Connector;

        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .declare_queue("work", QueueOptions::default(), &Arguments::new())
            .await
            .unwrap();
        channel
            .publish("", "work", b"payload", &MessageProperties::default())
            .await
            .unwrap();
        let mut stream = channel.consume("work", "c-1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (channel, delivery)
    }

    async fn failing(_envelope: Envelope) -> anyhow::Result<Disposition> {
        anyhow::bail!("downstream unavailable")
    }

    async fn panicking(_envelope: Envelope) -> anyhow::Result<Disposition> {
        panic!("handler bug")
    }

    async fn acking(_envelope: Envelope) -> anyhow::Result<Disposition> {
        Ok(Disposition::Ack)
    }

    #[tokio::test]
    async fn failing_handler_is_a_discard() {
        let broker = InMemoryBroker::new();
        let (channel, delivery) = channel_with_delivery(&broker).await;

        handle_delivery(channel, Arc::new(failing), delivery).await;

        let acks = broker.acknowledgements();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nack { requeue: false });
    }

    #[tokio::test]
    async fn panicking_handler_is_a_discard() {
        let broker = InMemoryBroker::new();
        let (channel, delivery) = channel_with_delivery(&broker).await;

        handle_delivery(channel, Arc::new(panicking), delivery).await;

        let acks = broker.acknowledgements();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].delivery_tag, 1);
        assert_eq!(acks[0].kind, AckKind::Nack { requeue: false });
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }

    #[test]
    fn queue_name_is_derived_from_the_parts() {
        let connection =
            PersistentConnection::new(Arc::new(InMemoryBroker::new()), RetryPolicy::exponential(0));
        let consumer = Consumer::new(connection.clone(), "order", "uat", "checkoutconsumer").unwrap();
        assert_eq!(consumer.queue_name(), "uat.queue.order.checkoutconsumer");

        assert!(matches!(
            Consumer::new(connection, "order", "uat", " "),
            Err(BusError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn zero_prefetch_is_rejected() {
        let broker = InMemoryBroker::new();
        let connection =
            PersistentConnection::new(Arc::new(broker.clone()), RetryPolicy::exponential(0));
        let consumer = Consumer::new(connection, "order", "uat", "checkoutconsumer").unwrap();

        let err = consumer.subscribe_once(acking, 0).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
        assert_eq!(broker.connect_attempts(), 0);
    }
}
