// Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eshop_event_bus::rabbitmq::{InMemoryBroker, PersistentConnection, RetryPolicy, Sleeper};

/// Records requested backoff instead of waiting it out.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn seconds(&self) -> Vec<u64> {
        self.slept.lock().unwrap().iter().map(Duration::as_secs).collect()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

pub fn retry_policy(retries: u32) -> (RetryPolicy, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    let policy = RetryPolicy::exponential(retries).with_sleeper(sleeper.clone());
    (policy, sleeper)
}

pub fn connect(broker: &InMemoryBroker, retries: u32) -> (PersistentConnection, Arc<RecordingSleeper>) {
    let (policy, sleeper) = retry_policy(retries);
    (PersistentConnection::new(Arc::new(broker.clone()), policy), sleeper)
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
