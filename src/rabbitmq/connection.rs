// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{
    Arguments, BrokerChannel, BrokerConnection, ConnectionEvent, Connector, ExchangeOptions,
    QueueInfo, QueueOptions,
};
use super::errors::{BusError, Result};
use super::retry::RetryPolicy;
use super::topology::ExchangeKind;

const REPLY_SUCCESS: u16 = 200;

type TaggedEvent = (u64, ConnectionEvent);

/// Owns the single long-lived broker connection, reconnects it when the broker
/// reports a failure, and hands out channels.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    current: RwLock<Option<Session>>,
    generation: AtomicU64,
    disposed: AtomicBool,
    // Only one reconnect in flight at a time.
    session_lock: AsyncMutex<()>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<TaggedEvent>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

impl PersistentConnection {
    pub fn new(connector: Arc<dyn Connector>, retry: RetryPolicy) -> Self {
        let (events, pending) = mpsc::unbounded_channel();

        PersistentConnection {
            inner: Arc::new(Inner {
                connector,
                retry,
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                session_lock: AsyncMutex::new(()),
                events,
                pending_events: Mutex::new(Some(pending)),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
            && read(&self.inner.current)
                .as_ref()
                .is_some_and(|session| session.connection.is_open())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Opens a new channel, connecting first if needed.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.is_disposed() {
            return Err(BusError::ConnectionUnavailable(
                "The RabbitMQ connection has been disposed".to_string(),
            ));
        }

        if !self.is_connected() {
            self.try_connect().await;
        }

        let connection = self.open_connection().ok_or_else(|| {
            BusError::ConnectionUnavailable(
                "No RabbitMQ connections are available to perform this action".to_string(),
            )
        })?;

        connection.create_channel().await
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        arguments: &Arguments,
    ) -> Result<()> {
        let channel = self.create_channel().await?;
        let result = channel.declare_exchange(name, kind, options, arguments).await;
        close_short_lived(channel.as_ref()).await;
        result?;

        info!(exchange = name, kind = %kind, "RMQ exchange {} is declared.", name);
        Ok(())
    }

    pub async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: &Arguments,
    ) -> Result<QueueInfo> {
        let channel = self.create_channel().await?;
        let result = channel.declare_queue(name, options, arguments).await;
        close_short_lived(channel.as_ref()).await;
        let queue = result?;

        info!(
            queue = name,
            "RMQ queue {} is declared. It has {} messages and {} consumers.",
            name,
            queue.message_count,
            queue.consumer_count
        );
        Ok(queue)
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()> {
        let channel = self.create_channel().await?;
        let result = channel
            .bind_queue(queue, exchange, routing_key, arguments)
            .await;
        close_short_lived(channel.as_ref()).await;
        result?;

        info!(
            queue,
            exchange,
            routing_key,
            "RMQ queue {} is bound to exchange {} by routing key {}.",
            queue,
            exchange,
            routing_key
        );
        Ok(())
    }

    /// Connects under the retry policy. Returns `false` once the budget is
    /// spent or the connection has been disposed; never errors.
    pub async fn try_connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }

        info!("RabbitMQ Client is trying to connect");
        let _session = self.inner.session_lock.lock().await;

        if self.is_disposed() {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        let this = self;
        let result = self
            .inner
            .retry
            .run("RabbitMQ Client could not connect", || async move {
                if this.is_disposed() {
                    return Err(BusError::ConnectionUnavailable(
                        "The RabbitMQ connection has been disposed".to_string(),
                    ));
                }
                this.inner.connector.connect().await
            })
            .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = %err, "Fatal error: RabbitMQ connections could not be created and opened");
                return false;
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.inner.events.clone();
        connection.on_event(Box::new(move |event| {
            // Receiver is gone only after disposal.
            let _ = events.send((generation, event));
        }));

        let endpoint = connection.endpoint();
        *write(&self.inner.current) = Some(Session {
            generation,
            connection,
        });

        // dispose() may have run while we were connecting.
        if self.is_disposed() {
            let stale = write(&self.inner.current).take();
            if let Some(stale) = stale {
                close_connection(stale.connection.as_ref()).await;
            }
            return false;
        }

        self.ensure_watcher();
        info!(
            host = %endpoint,
            "RabbitMQ Client acquired a persistent connection to '{}' and is subscribed to failure events",
            endpoint
        );
        true
    }

    /// Tears the connection down for good. Idempotent and infallible.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }

        let session = write(&self.inner.current).take();
        if let Some(session) = session {
            close_connection(session.connection.as_ref()).await;
        }
        debug!("RabbitMQ persistent connection disposed");
    }

    /// A probe that reports connection status without keeping it alive.
    pub(crate) fn status_probe(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let inner = Arc::downgrade(&self.inner);
        move || {
            inner
                .upgrade()
                .is_some_and(|inner| PersistentConnection { inner }.is_connected())
        }
    }

    fn open_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        if self.is_disposed() {
            return None;
        }
        read(&self.inner.current)
            .as_ref()
            .filter(|session| session.connection.is_open())
            .map(|session| session.connection.clone())
    }

    /// Drops the current connection if it is the one that raised the event.
    fn invalidate(&self, generation: u64) -> Option<Arc<dyn BrokerConnection>> {
        let mut current = write(&self.inner.current);
        if current
            .as_ref()
            .is_some_and(|session| session.generation == generation)
        {
            current.take().map(|session| session.connection)
        } else {
            None
        }
    }

    fn ensure_watcher(&self) {
        let Some(events) = lock(&self.inner.pending_events).take() else {
            return;
        };
        let handle = tokio::spawn(watch_connection(Arc::downgrade(&self.inner), events));
        *lock(&self.inner.watcher) = Some(handle);
    }
}

/// Turns broker notifications into reconnect attempts, off the transport's
/// dispatch thread.
async fn watch_connection(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TaggedEvent>) {
    while let Some((generation, event)) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let connection = PersistentConnection { inner };
        if connection.is_disposed() {
            break;
        }

        let Some(stale) = connection.invalidate(generation) else {
            debug!(generation, %event, "Ignoring event from a replaced RabbitMQ connection");
            continue;
        };

        match event {
            ConnectionEvent::Shutdown(_) => {
                warn!(%event, "A RabbitMQ connection is on shutdown. Trying to re-connect...")
            }
            ConnectionEvent::Blocked(_) => {
                warn!(%event, "A RabbitMQ connection is blocked. Trying to re-connect...")
            }
            ConnectionEvent::CallbackError(_) => {
                warn!(%event, "A RabbitMQ connection throw exception. Trying to re-connect...")
            }
        }

        close_connection(stale.as_ref()).await;
        connection.try_connect().await;
    }
}

async fn close_connection(connection: &dyn BrokerConnection) {
    if !connection.is_open() {
        return;
    }
    if let Err(err) = connection
        .close(REPLY_SUCCESS, "Dispose of PersistentConnection")
        .await
    {
        error!(severity = "critical", error = %err, "Something went wrong disposing rmq connection.");
    }
}

async fn close_short_lived(channel: &dyn BrokerChannel) {
    if !channel.is_open() {
        return;
    }
    if let Err(err) = channel.close(REPLY_SUCCESS, "Declaration complete").await {
        debug!(error = %err, "Could not close short-lived RabbitMQ channel");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
