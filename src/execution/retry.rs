//! Retry policy with exponential backoff
//!
//! Only errors classified as transient by [`Error::is_retryable`] are
//! retried; everything else fails on the first attempt.

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryStrategy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// +/- spread applied to each delay, in percent
    #[serde(default = "default_jitter_percentage")]
    pub jitter_percentage: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_percentage() -> f64 {
    10.0
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_percentage: default_jitter_percentage(),
        }
    }
}

impl RetryStrategy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.backoff_multiplier >= 1.0) {
            anyhow::bail!("backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=100.0).contains(&self.jitter_percentage) {
            anyhow::bail!("jitter_percentage must be within 0..=100");
        }
        if self.max_delay_ms < self.initial_delay_ms {
            anyhow::bail!("max_delay_ms must not be below initial_delay_ms");
        }
        Ok(())
    }

    /// Fresh backoff schedule for one retried operation
    pub fn backoff(&self) -> LimitedBackoff {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_delay_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_randomization_factor(self.jitter_percentage / 100.0)
            .with_max_elapsed_time(None)
            .build();

        LimitedBackoff {
            inner,
            remaining: self.max_retries,
            max_retries: self.max_retries,
        }
    }
}

/// Exponential backoff that gives up after a fixed number of retries
/// instead of after an elapsed-time budget
pub struct LimitedBackoff {
    inner: ExponentialBackoff,
    remaining: u32,
    max_retries: u32,
}

impl Backoff for LimitedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.remaining = self.max_retries;
        self.inner.reset();
    }
}

/// Run `f` under `strategy`, retrying transient failures.
///
/// Returns the last error once retries are exhausted, or the first
/// non-transient error immediately.
pub async fn with_retry<T, F, Fut>(strategy: &RetryStrategy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = retry_notify(
        strategy.backoff(),
        || {
            let attempt = f();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, delay: Duration| {
            debug!(
                operation,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying: {}",
                e
            );
        },
    )
    .await;

    if let Err(e) = &result {
        if e.is_retryable() {
            warn!(operation, retries = strategy.max_retries, "Retries exhausted: {}", e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryStrategy {
        RetryStrategy {
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_percentage: 0.0,
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped_and_limited() {
        let mut backoff = RetryStrategy {
            max_retries: 4,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
            jitter_percentage: 0.0,
        }
        .backoff();

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_backoff())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RetryStrategy::default().validate().is_ok());
        assert!(RetryStrategy {
            backoff_multiplier: 0.5,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(RetryStrategy {
            jitter_percentage: 150.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(RetryStrategy {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast(), "test", || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Exchange("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::RateLimited("slow down".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::RateLimited(_))));
        // First attempt plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::OrderRejected("invalid quantity".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::OrderRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
