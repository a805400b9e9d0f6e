//! Bounded retries with exponential backoff, for source fetches and sink writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::FetchError;

/// Exponential backoff: `initial * factor^(attempt - 1)`, capped at `max`, with optional jitter.
/// Runs out after `max_attempts` delays.
#[derive(Debug, Clone)]
pub(crate) struct Exponential {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: u16,
    attempt: u16,
}

impl Exponential {
    pub(crate) fn new(
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: u16,
    ) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    fn delay(&self, attempt: u16) -> Duration {
        // attempt is at least 1 here, powi(-1) would shrink the delay
        let exponent = i32::from(attempt.max(1) - 1);
        let base_ms = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let delay_ms = if self.jitter == 0.0 {
            base_ms
        } else {
            base_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };
        Duration::from_millis(delay_ms as u64).min(self.max)
    }
}

impl From<&RetryConfig> for Exponential {
    fn from(config: &RetryConfig) -> Self {
        Exponential::new(
            Duration::from_millis(u64::from(config.initial_retry_interval_in_ms)),
            Duration::from_millis(u64::from(config.max_retry_interval_in_ms)),
            config.retry_factor,
            config.retry_jitter,
            config.max_retry_attempts,
        )
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}

/// Runs `fetch` until it succeeds, fails permanently, the backoff runs out, or the token is
/// cancelled. Only [FetchError::Transient] is retried. The last error is returned on give-up.
pub(crate) async fn fetch_with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    entity: &str,
    mut fetch: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut backoff = Exponential::from(config);
    let mut retry_attempt = 0u16;
    loop {
        let err = match fetch().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        let Some(delay) = backoff.next() else {
            warn!(entity, ?retry_attempt, error = %err, "Retries exhausted for fetch");
            return Err(err);
        };
        retry_attempt += 1;
        warn!(entity, ?retry_attempt, ?delay, error = %err, "Retrying fetch after transient error");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(err),
        }
    }
}
