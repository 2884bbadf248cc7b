//! Bounded exponential backoff for transient handshake-service failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::errors::HandshakeError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fraction (0.0 – 1.0) of each delay that may be shaved off at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_millis(4000),
            max_attempts: 4,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay after the `retry`-th failure (0-based): `min(cap, base * 2^retry)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        delay.mul_f64(1.0 - shave)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, HandshakeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HandshakeError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.jittered_delay(attempt - 1);
                debug!(
                    "Attempt {attempt}/{} failed ({e}), retrying after {}ms",
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
