//! REST client for MEXC/Binance-style v3 spot APIs
//!
//! Public endpoints (`exchangeInfo`, `ticker/price`) are unsigned. Order
//! placement is signed with HMAC-SHA256 over the exact query string.
//!
//! Rate limits apply - the detector's tier intervals are the main throttle.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ExchangeClient, OrderFill, OrderRequest, SymbolInfo};
use crate::config::ExchangeConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on signed requests
pub const API_KEY_HEADER: &str = "X-MEXC-APIKEY";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    #[serde(default)]
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    symbol: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    is_spot_trading_allowed: Option<bool>,
    #[serde(default)]
    base_asset_precision: Option<u32>,
    #[serde(default)]
    quote_precision: Option<u32>,
    #[serde(default)]
    quote_asset_precision: Option<u32>,
}

impl RawSymbol {
    fn into_info(self) -> SymbolInfo {
        // MEXC reports "1" for online, Binance-compatible venues "TRADING"
        let online = matches!(self.status.as_str(), "1" | "ENABLED" | "TRADING");
        SymbolInfo {
            is_active: online && self.is_spot_trading_allowed.unwrap_or(true),
            price_scale: self
                .quote_precision
                .or(self.quote_asset_precision)
                .unwrap_or(8),
            quantity_scale: self.base_asset_precision.unwrap_or(8),
            symbol: self.symbol,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: serde_json::Value,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    orig_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// One upcoming listing from the exchange's new-coin calendar
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub vcoin_id: String,
    pub coin: String,
    pub first_open_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CalendarResponse {
    data: CalendarData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarData {
    #[serde(default)]
    new_coins: Vec<RawCalendarCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCalendarCoin {
    vcoin_id: String,
    vcoin_name: String,
    #[serde(default)]
    first_open_time: Option<i64>,
}

/// REST exchange client
pub struct RestExchangeClient {
    client: Client,
    config: ExchangeConfig,
}

impl RestExchangeClient {
    /// Create a new REST client
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!("Exchange client initialized for {}", config.base_url);

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Sign a query string with the configured API secret
    fn sign(&self, query: &str) -> Result<String> {
        sign_query(&self.config.api_secret, query)
    }

    /// Fetch the new-coin calendar (upcoming listings)
    pub async fn fetch_calendar(&self, calendar_url: &str) -> Result<Vec<CalendarEntry>> {
        let url = format!(
            "{}?timestamp={}",
            calendar_url,
            Utc::now().timestamp_millis()
        );
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        let body: CalendarResponse = response.json().await?;

        let entries = body
            .data
            .new_coins
            .into_iter()
            .filter_map(|coin| {
                let ts = coin.first_open_time?;
                let first_open_time = Utc.timestamp_millis_opt(ts).single()?;
                Some(CalendarEntry {
                    vcoin_id: coin.vcoin_id,
                    coin: coin.vcoin_name,
                    first_open_time,
                })
            })
            .collect::<Vec<_>>();

        debug!("Calendar returned {} upcoming listings", entries.len());
        Ok(entries)
    }
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn get_tradable_symbols(&self) -> Result<Vec<SymbolInfo>> {
        let response = self
            .client
            .get(self.url("/api/v3/exchangeInfo"))
            .send()
            .await?;
        let response = check_status(response).await?;
        let info: ExchangeInfoResponse = response.json().await?;

        Ok(info.symbols.into_iter().map(RawSymbol::into_info).collect())
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let response = self
            .client
            .get(self.url("/api/v3/ticker/price"))
            .query(&[("symbol", symbol)])
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            return Err(Error::SymbolNotFound(symbol.to_string()));
        }
        let response = check_status(response).await?;
        let ticker: TickerPrice = response.json().await?;

        let price: f64 = ticker
            .price
            .parse()
            .map_err(|_| Error::Deserialization(format!("Bad price '{}'", ticker.price)))?;

        if !price.is_finite() || price <= 0.0 {
            return Err(Error::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        Ok(price)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        if self.config.api_key.is_empty() || self.config.api_secret.is_empty() {
            return Err(Error::Config(
                "API key and secret required for order placement".to_string(),
            ));
        }

        let query = order_query(
            order,
            self.config.recv_window_ms,
            Utc::now().timestamp_millis(),
        );
        let signature = self.sign(&query)?;

        info!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            "Submitting market order"
        );

        let response = self
            .client
            .post(format!(
                "{}?{}&signature={}",
                self.url("/api/v3/order"),
                query,
                signature
            ))
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: OrderResponse = response.json().await?;

        Ok(body.into_fill(order.quantity))
    }
}

impl OrderResponse {
    fn into_fill(self, requested_qty: f64) -> OrderFill {
        let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<f64>().ok());

        let executed_qty = parse(&self.executed_qty)
            .filter(|q| *q > 0.0)
            .or_else(|| parse(&self.orig_qty))
            .unwrap_or(requested_qty);

        let avg_price = match parse(&self.cummulative_quote_qty) {
            Some(quote) if quote > 0.0 && executed_qty > 0.0 => quote / executed_qty,
            _ => parse(&self.price).unwrap_or(0.0),
        };

        let order_id = match self.order_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        OrderFill {
            order_id,
            executed_qty,
            avg_price,
        }
    }
}

/// HMAC-SHA256 hex signature of a query string
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Unsigned order query string. A client order id lets the exchange
/// refuse a retried submission of an order that already went through.
fn order_query(order: &OrderRequest, recv_window_ms: u64, timestamp_ms: i64) -> String {
    let mut query = format!(
        "symbol={}&side={}&type={}&quantity={}",
        order.symbol, order.side, order.order_type, order.quantity
    );
    if let Some(id) = &order.client_order_id {
        query.push_str(&format!("&newClientOrderId={}", id));
    }
    query.push_str(&format!(
        "&recvWindow={}&timestamp={}",
        recv_window_ms, timestamp_ms
    ));
    query
}

/// Map HTTP status codes onto the transient/terminal error split
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| format!("{} (code {})", e.msg, e.code))
        .unwrap_or(body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("Exchange rate limit hit: {}", message);
        return Err(Error::RateLimited(message));
    }
    if status.is_server_error() {
        return Err(Error::ExchangeUnavailable {
            status: status.as_u16(),
            message,
        });
    }
    Err(Error::OrderRejected(message))
}
