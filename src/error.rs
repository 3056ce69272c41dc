//! Error types for the listing sniper

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the listing sniper
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Exchange errors
    #[error("Exchange request failed: {0}")]
    Exchange(String),

    #[error("Exchange rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange unavailable (HTTP {status}): {message}")]
    ExchangeUnavailable { status: u16, message: String },

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order timed out after {0}ms")]
    OrderTimeout(u64),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid price for {symbol}: {price}")]
    InvalidPrice { symbol: String, price: f64 },

    // Execution guard errors
    #[error("Circuit breaker open, retry in {remaining_ms}ms")]
    CircuitOpen { remaining_ms: u64 },

    // Registry errors
    #[error("Listing not found: {0}")]
    ListingNotFound(String),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("State persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Exchange(_)
                | Error::RateLimited(_)
                | Error::ExchangeUnavailable { .. }
                | Error::OrderTimeout(_)
        )
    }

    /// Check if the exchange refused the request outright
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::OrderRejected(_) | Error::SymbolNotFound(_) | Error::InvalidPrice { .. }
        )
    }

    /// Check if this error is a per-attempt safety timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::OrderTimeout(_))
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            // Connect, timeout and body errors are all worth another attempt
            Error::Exchange(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::Exchange("connection reset".into()).is_retryable());
        assert!(Error::RateLimited("429".into()).is_retryable());
        assert!(Error::OrderTimeout(2000).is_retryable());
        assert!(Error::ExchangeUnavailable {
            status: 503,
            message: "maintenance".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_rejections_are_terminal() {
        let err = Error::OrderRejected("quantity below minimum".into());
        assert!(!err.is_retryable());
        assert!(err.is_rejection());
        assert!(!Error::CircuitOpen { remaining_ms: 10 }.is_retryable());
    }
}
