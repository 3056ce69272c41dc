//! Scripted in-memory exchange used by unit tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ExchangeClient, OrderFill, OrderRequest, SymbolInfo};
use crate::error::{Error, Result};

/// Scripted result for the next `place_order` call
#[derive(Debug, Clone)]
pub enum MockOrder {
    Fill { executed_qty: f64, avg_price: f64 },
    Transient(String),
    Reject(String),
    /// Never answers within any sane timeout
    Hang,
    /// Fills the requested quantity after a delay
    Slow(Duration),
}

#[derive(Default)]
pub struct MockExchange {
    symbols: Mutex<Vec<SymbolInfo>>,
    fail_symbols: Mutex<bool>,
    prices: Mutex<HashMap<String, f64>>,
    orders: Mutex<VecDeque<MockOrder>>,
    placed: Mutex<Vec<OrderRequest>>,
    pub symbol_calls: AtomicUsize,
    pub price_calls: AtomicUsize,
    pub order_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_symbol(&self, symbol: &str, is_active: bool) {
        let mut symbols = self.symbols.lock().unwrap();
        symbols.retain(|s| s.symbol != symbol);
        symbols.push(SymbolInfo {
            symbol: symbol.to_string(),
            is_active,
            price_scale: 4,
            quantity_scale: 2,
        });
    }

    pub fn set_symbols_failing(&self, failing: bool) {
        *self.fail_symbols.lock().unwrap() = failing;
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn push_order(&self, order: MockOrder) {
        self.orders.lock().unwrap().push_back(order);
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }

    pub fn orders_placed(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_tradable_symbols(&self) -> Result<Vec<SymbolInfo>> {
        self.symbol_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_symbols.lock().unwrap() {
            return Err(Error::Exchange("exchangeInfo unavailable".into()));
        }
        Ok(self.symbols.lock().unwrap().clone())
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        let n = self.order_calls.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().unwrap().push(order.clone());

        let next = self.orders.lock().unwrap().pop_front();
        match next.unwrap_or(MockOrder::Fill {
            executed_qty: order.quantity,
            avg_price: 0.0,
        }) {
            MockOrder::Fill {
                executed_qty,
                avg_price,
            } => Ok(OrderFill {
                order_id: format!("mock-{}", n + 1),
                executed_qty,
                avg_price,
            }),
            MockOrder::Transient(msg) => Err(Error::Exchange(msg)),
            MockOrder::Reject(msg) => Err(Error::OrderRejected(msg)),
            MockOrder::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(OrderFill {
                    order_id: format!("mock-{}", n + 1),
                    executed_qty: order.quantity,
                    avg_price: 0.0,
                })
            }
            MockOrder::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Exchange("hung call returned".into()))
            }
        }
    }
}
