//! Snipe execution: retry policy, circuit breaker, error log and executor

pub mod circuit_breaker;
pub mod error_log;
pub mod executor;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitPermit};
pub use error_log::{ErrorEntry, ErrorLog};
pub use executor::{ExecutionOutcome, SnipeExecutor};
pub use retry::{with_retry, RetryStrategy};
