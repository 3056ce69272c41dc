//! Snipe executor
//!
//! Turns a ready [`Target`] into exactly one terminal [`Snipe`] record:
//! claim the target, fetch the live price, size the order from the
//! configured notional and submit it under the retry policy, a per-attempt
//! safety timeout and the circuit breaker.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use super::error_log::{ErrorEntry, ErrorLog};
use super::retry::with_retry;
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, SniperEvent};
use crate::exchange::{ExchangeClient, OrderFill, OrderRequest};
use crate::registry::{ClaimOutcome, ListingStatus, Snipe, SnipeStatus, Target, TargetRegistry};

pub const MSG_ALREADY_EXECUTED: &str = "Target already executed";
pub const MSG_IN_PROGRESS: &str = "Target execution already in progress";
pub const MSG_TEST_MODE: &str = "Test mode execution successful";
pub const MSG_INTERRUPTED: &str = "Execution interrupted while the order was in flight";

/// Result of one `execute_snipe` call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub order_id: Option<String>,
    pub message: String,
    /// Terminal record, if this call wrote one or found one
    pub snipe: Option<Snipe>,
}

impl ExecutionOutcome {
    fn refused(message: impl Into<String>, snipe: Option<Snipe>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: message.into(),
            snipe,
        }
    }
}

/// Decrements the in-flight counter however the execution ends
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SnipeExecutor {
    config: ExecutionConfig,
    registry: Arc<TargetRegistry>,
    events: EventBus,
    breaker: CircuitBreaker,
    errors: Arc<RwLock<ErrorLog>>,
    in_flight: AtomicUsize,
}

impl SnipeExecutor {
    pub fn new(config: ExecutionConfig, registry: Arc<TargetRegistry>, events: EventBus) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let errors = Arc::new(RwLock::new(ErrorLog::new(config.error_log_capacity)));
        Self {
            config,
            registry,
            events,
            breaker,
            errors,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_test_mode(&self) -> bool {
        self.config.test_mode
    }

    /// Execute `target` at most once.
    ///
    /// Never returns an error: every failure ends up in the outcome message
    /// and, when an attempt was actually made, in the snipe record.
    pub async fn execute_snipe(&self, target: &Target, client: &dyn ExchangeClient) -> ExecutionOutcome {
        let symbol = target.symbol.as_str();

        let mut claim = match self.registry.claim_execution(symbol) {
            ClaimOutcome::Acquired(claim) => claim,
            ClaimOutcome::AlreadyExecuted(snipe) => {
                info!(symbol = %symbol, status = %snipe.status, "Skipping execution, target already executed");
                return ExecutionOutcome::refused(MSG_ALREADY_EXECUTED, Some(snipe));
            }
            ClaimOutcome::InProgress => {
                warn!(symbol = %symbol, "Skipping execution, another attempt is in flight");
                return ExecutionOutcome::refused(MSG_IN_PROGRESS, None);
            }
        };

        let permit = match self.breaker.allow() {
            Ok(permit) => permit,
            Err(remaining) => {
                let err = Error::CircuitOpen {
                    remaining_ms: remaining.as_millis() as u64,
                };
                warn!(symbol = %symbol, "Execution fast-failed: {}", err);
                self.log_error("circuit", symbol, err.to_string()).await;
                // Dropping the claim leaves the target executable after cool-down
                drop(claim);
                return ExecutionOutcome::refused(err.to_string(), None);
            }
        };

        let _in_flight = InFlightGuard::enter(&self.in_flight);

        let mut snipe = Snipe {
            id: Uuid::new_v4().to_string(),
            target_symbol: target.symbol.clone(),
            status: SnipeStatus::Failed,
            side: self.config.side,
            executed_at: Utc::now(),
            requested_qty: 0.0,
            executed_qty: 0.0,
            avg_price: 0.0,
            order_id: None,
            error: None,
            pnl: Vec::new(),
        };

        let result = match self.fetch_price(target, client).await {
            Ok(price) => {
                let qty = round_to_scale(self.config.notional_amount / price, target.quantity_scale);
                snipe.requested_qty = qty;
                if qty <= 0.0 {
                    Err(Error::OrderRejected(format!(
                        "Notional {} at price {} rounds to zero quantity",
                        self.config.notional_amount, price
                    )))
                } else {
                    let client_order_id = client_order_id(&snipe.id);
                    if !self.config.test_mode {
                        // From here the order may be live; cancellation must not reopen the target
                        let mut interrupted = snipe.clone();
                        interrupted.status = SnipeStatus::TimedOut;
                        interrupted.error = Some(format!(
                            "{}, check client order {}",
                            MSG_INTERRUPTED, client_order_id
                        ));
                        claim.arm(interrupted);
                    }
                    self.submit(target, &client_order_id, qty, price, client)
                        .await
                        .map(|fill| (fill, price))
                }
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok((fill, quoted)) => {
                snipe.status = SnipeStatus::Executed;
                snipe.executed_at = Utc::now();
                snipe.executed_qty = fill.executed_qty;
                // Exchanges that do not report a fill price get the quote
                snipe.avg_price = if fill.avg_price > 0.0 {
                    fill.avg_price
                } else {
                    quoted
                };
                snipe.order_id = Some(fill.order_id.clone());
                permit.record_success();

                let message = if self.config.test_mode {
                    MSG_TEST_MODE.to_string()
                } else {
                    format!("Order {} filled", fill.order_id)
                };
                info!(
                    symbol = %symbol,
                    order_id = %fill.order_id,
                    qty = snipe.executed_qty,
                    price = snipe.avg_price,
                    test_mode = self.config.test_mode,
                    "Snipe executed"
                );
                (true, Some(fill.order_id), message)
            }
            Err(e) => {
                snipe.status = if e.is_timeout() {
                    SnipeStatus::TimedOut
                } else {
                    SnipeStatus::Failed
                };
                snipe.error = Some(e.to_string());

                // A rejection proves the exchange is reachable
                if e.is_rejection() {
                    permit.release();
                } else {
                    permit.record_failure();
                }

                error!(symbol = %symbol, status = %snipe.status, "Snipe failed: {}", e);
                self.log_error("order", symbol, e.to_string()).await;
                (false, None, e.to_string())
            }
        };

        let snipe = claim.complete(snipe);
        let at = Utc::now();
        if snipe.is_executed() {
            if let Err(e) = self.registry.advance_listing(&target.vcoin_id, ListingStatus::Sniped) {
                warn!(symbol = %symbol, "Could not mark listing sniped: {}", e);
            }
            self.events.emit(SniperEvent::SnipeExecuted {
                snipe: snipe.clone(),
                at,
            });
        } else {
            self.events.emit(SniperEvent::SnipeFailed {
                snipe: snipe.clone(),
                at,
            });
        }

        let (success, order_id, message) = outcome;
        ExecutionOutcome {
            success,
            order_id,
            message,
            snipe: Some(snipe),
        }
    }

    async fn fetch_price(&self, target: &Target, client: &dyn ExchangeClient) -> Result<f64> {
        let symbol = target.symbol.as_str();
        let price = with_retry(&self.config.retry, "get_price", || client.get_price(symbol)).await?;
        if !price.is_finite() || price <= 0.0 {
            return Err(Error::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        Ok(price)
    }

    async fn submit(
        &self,
        target: &Target,
        client_order_id: &str,
        quantity: f64,
        price: f64,
        client: &dyn ExchangeClient,
    ) -> Result<OrderFill> {
        if self.config.test_mode {
            return Ok(OrderFill {
                order_id: format!("test-{}", Uuid::new_v4()),
                executed_qty: quantity,
                avg_price: price,
            });
        }

        // Every retry resubmits the same client order id
        let order = OrderRequest::market(&target.symbol, self.config.side, quantity)
            .with_client_order_id(client_order_id);
        let limit_ms = self.config.max_execution_time_ms;
        let limit = Duration::from_millis(limit_ms);

        info!(
            symbol = %order.symbol,
            side = %order.side,
            quantity,
            "Submitting market order"
        );
        with_retry(&self.config.retry, "place_order", || {
            let order = &order;
            async move {
                match tokio::time::timeout(limit, client.place_order(order)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::OrderTimeout(limit_ms)),
                }
            }
        })
        .await
    }

    async fn log_error(&self, source: &'static str, symbol: &str, message: String) {
        self.errors.write().await.push(source, symbol, message);
    }

    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    /// Executions currently between claim and terminal record
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.errors.read().await.entries()
    }

    pub async fn error_log_size(&self) -> usize {
        self.errors.read().await.len()
    }
}

/// Exchange-side idempotency key for a snipe (32 chars, `[0-9a-f]`)
fn client_order_id(snipe_id: &str) -> String {
    snipe_id.replace('-', "")
}

/// Round half away from zero to `scale` decimal places
pub fn round_to_scale(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (value * factor).round() / factor
}
