// src/rabbitmq/retry.rs

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::errors::Result;

/// Waits between attempts. Tests swap in a recording clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential wait-and-retry: the first attempt plus `retries` more, waiting
/// `base_delay * 2^attempt` before retry number `attempt`.
#[derive(Clone)]
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub const DEFAULT_RETRIES: u32 = 5;

    pub fn exponential(retries: u32) -> Self {
        Self {
            retries,
            base_delay: Duration::from_secs(1),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or the retry budget is spent. `what` prefixes the warning logged for
    /// each failed attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        retries = self.retries,
                        error = %err,
                        "{} after {:.1}s",
                        what,
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Self::DEFAULT_RETRIES)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .finish()
    }
}
