// src/rabbitmq/channel_manager.rs

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use super::broker::BrokerChannel;
use super::connection::PersistentConnection;
use super::errors::Result;

const REPLY_SUCCESS: u16 = 200;

/// Runs a topology declaration at most once per owner, even when the first
/// callers race: check the flag, take the lock, check again.
#[derive(Default)]
pub struct DeclareOnce {
    declared: AtomicBool,
    lock: AsyncMutex<()>,
}

impl DeclareOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_declared(&self) -> bool {
        self.declared.load(Ordering::Acquire)
    }

    pub async fn run<F, Fut>(&self, declare: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.is_declared() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        if self.is_declared() {
            return Ok(());
        }

        declare().await?;
        self.declared.store(true, Ordering::Release);
        Ok(())
    }
}

/// Lazily creates and caches one channel for its owner. A channel that has
/// been closed underneath is replaced on the next request.
pub struct ChannelManager {
    connection: PersistentConnection,
    // "exchange <name>" / "queue <name>", for logs.
    label: String,
    current: RwLock<Option<Arc<dyn BrokerChannel>>>,
    init: AsyncMutex<()>,
}

impl ChannelManager {
    pub fn new(connection: PersistentConnection, label: String) -> Self {
        debug!(label = %label, "Creating channel manager");

        Self {
            connection,
            label,
            current: RwLock::new(None),
            init: AsyncMutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The cached channel if it is still open.
    pub fn cached(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Get a channel, creating one if needed. `prefetch` is applied to new
    /// channels only.
    pub async fn get_channel(&self, prefetch: Option<u16>) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.cached() {
            return Ok(channel);
        }

        let _guard = self.init.lock().await;
        if let Some(channel) = self.cached() {
            return Ok(channel);
        }

        debug!(label = %self.label, "Creating new channel");
        let channel = self.connection.create_channel().await?;

        if let Some(prefetch) = prefetch {
            if let Err(err) = channel.set_prefetch(prefetch).await {
                close_quietly(channel.as_ref(), &self.label, "Failed to configure channel").await;
                return Err(err);
            }
        }

        let label = self.label.clone();
        let connection_open = self.connection.status_probe();
        channel.on_error(Box::new(move |err| {
            error!(
                label = %label,
                error = %err,
                connection_open = connection_open(),
                "A RabbitMQ channel for {} was shut down. The connection is open {}",
                label,
                connection_open()
            );
        }));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
        Ok(channel)
    }

    /// Forgets the cached channel so the next request opens a fresh one.
    pub fn invalidate(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Closes and forgets the cached channel. Safe to call repeatedly.
    pub async fn close(&self, reason: &str) {
        if let Some(channel) = self.invalidate() {
            close_quietly(channel.as_ref(), &self.label, reason).await;
        }
    }
}

pub(crate) async fn close_quietly(channel: &dyn BrokerChannel, label: &str, reason: &str) {
    if !channel.is_open() {
        return;
    }
    if let Err(err) = channel.close(REPLY_SUCCESS, reason).await {
        warn!(label, error = %err, "Failed to close RabbitMQ channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::errors::BusError;
    use crate::rabbitmq::memory::InMemoryBroker;
    use crate::rabbitmq::retry::RetryPolicy;
    use std::sync::atomic::AtomicU32;

    fn manager(broker: &InMemoryBroker) -> ChannelManager {
        let connection =
            PersistentConnection::new(Arc::new(broker.clone()), RetryPolicy::exponential(0));
        ChannelManager::new(connection, "queue test".to_string())
    }

    #[tokio::test]
    async fn declare_once_runs_a_single_time() {
        let once = Arc::new(DeclareOnce::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let once = once.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                once.run(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(once.is_declared());
    }

    #[tokio::test]
    async fn failed_declaration_is_retried_next_time() {
        let once = DeclareOnce::new();

        let first = once
            .run(|| async { Err(BusError::Channel("closed".into())) })
            .await;
        assert!(first.is_err());
        assert!(!once.is_declared());

        once.run(|| async { Ok(()) }).await.unwrap();
        assert!(once.is_declared());
    }

    #[tokio::test]
    async fn channel_is_cached_until_closed() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let first = manager.get_channel(None).await.unwrap();
        let second = manager.get_channel(None).await.unwrap();
        assert_eq!(first.id(), second.id());

        first.close(200, "test").await.unwrap();
        let third = manager.get_channel(None).await.unwrap();
        assert_ne!(first.id(), third.id());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let channel = manager.get_channel(Some(10)).await.unwrap();
        manager.close("done").await;
        manager.close("done").await;

        assert!(!channel.is_open());
        assert!(manager.cached().is_none());
    }
}
