//! Exchange access
//!
//! The core only needs three capabilities from an exchange: the current
//! tradable symbol set, a spot price, and market order placement. Anything
//! implementing [`ExchangeClient`] can drive the detector and executor.

pub mod rest;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use rest::RestExchangeClient;

/// Trading state of one symbol as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Open for spot trading right now
    pub is_active: bool,
    /// Decimal places allowed in prices
    pub price_scale: u32,
    /// Decimal places allowed in base-asset quantities
    pub quantity_scale: u32,
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl Default for OrderSide {
    fn default() -> Self {
        Self::Buy
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order submission parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Base-asset quantity, already rounded to the symbol's quantity scale
    pub quantity: f64,
    /// Idempotency key; resubmitting the same id never opens a second order
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Fill report for a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub executed_qty: f64,
    /// Average fill price; zero when the exchange did not report one
    pub avg_price: f64,
}

/// Capability the detector, executor and tracker consume.
///
/// Implementations must be safe to call concurrently; errors must be
/// classified so that [`crate::error::Error::is_retryable`] separates transient
/// transport failures from terminal rejections.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current symbol/trading-state snapshot
    async fn get_tradable_symbols(&self) -> Result<Vec<SymbolInfo>>;

    /// Latest traded price for a symbol
    async fn get_price(&self, symbol: &str) -> Result<f64>;

    /// Submit an order
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill>;
}
