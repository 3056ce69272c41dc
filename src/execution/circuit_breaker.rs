//! Consecutive-failure circuit breaker for order execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial is allowed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CircuitState {
    Closed,
    Open { until: Instant },
    /// One trial is running; its outcome decides the next state
    HalfOpen,
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The guarded section never panics, recover the data if it somehow did
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to run an execution.
    ///
    /// `Err(remaining)` while open. After the cool-down exactly one caller
    /// is let through (half-open); others keep failing fast until that
    /// trial reports back through its permit.
    pub fn allow(&self) -> Result<CircuitPermit<'_>, Duration> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open { until } => {
                let now = Instant::now();
                if now < until {
                    return Err(until - now);
                }
                info!("Circuit breaker cool-down expired, allowing one trial execution");
                inner.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::HalfOpen => return Err(Duration::ZERO),
        };
        Ok(CircuitPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Utc::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            _ => inner.consecutive_failures >= self.config.failure_threshold,
        };
        if trip {
            let cooldown = Duration::from_millis(self.config.cooldown_ms);
            inner.state = CircuitState::Open {
                until: Instant::now() + cooldown,
            };
            warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit breaker tripped, fast-failing executions"
            );
        }
    }

    /// Release a half-open trial that ended without a verdict
    /// (e.g. the target turned out to be already executed)
    pub fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open {
                until: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            is_open: !matches!(inner.state, CircuitState::Closed),
            failure_count: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
        }
    }
}

/// Admission granted by [`CircuitBreaker::allow`].
///
/// A half-open trial that is dropped without a verdict (its future was
/// cancelled) gives the trial slot back.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    /// Finish without a verdict on exchange health
    pub fn release(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.abandon_trial();
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            debug!("Half-open trial dropped without a verdict, slot released");
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 1000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_at_threshold() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.state().is_open);
        assert!(cb.allow().is_ok());

        cb.record_failure();
        let state = cb.state();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 3);
        assert!(state.last_failure_at.is_some());
        assert!(cb.allow().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }

        tokio::time::advance(Duration::from_millis(1001)).await;
        let trial = cb.allow().unwrap();
        assert!(trial.is_trial());
        // Second caller during the trial is refused
        assert_eq!(cb.allow().err(), Some(Duration::ZERO));

        trial.record_success();
        assert!(!cb.state().is_open);
        assert_eq!(cb.state().failure_count, 0);
        assert!(cb.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1001)).await;
        cb.allow().unwrap().record_failure();

        assert!(cb.state().is_open);
        assert!(cb.allow().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(1001)).await;

        {
            let trial = cb.allow().unwrap();
            assert!(trial.is_trial());
            assert!(cb.allow().is_err());
        }

        // The next caller becomes the trial instead of waiting forever
        let retry = cb.allow().unwrap();
        assert!(retry.is_trial());
        retry.record_success();
        assert!(!cb.state().is_open);
    }

    #[test]
    fn test_closed_permit_drop_keeps_state() {
        let cb = breaker();
        let permit = cb.allow().unwrap();
        assert!(!permit.is_trial());
        drop(permit);
        assert!(!cb.state().is_open);
        assert_eq!(cb.state().failure_count, 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(!cb.state().is_open);
        assert_eq!(cb.state().failure_count, 1);
    }
}
