//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::exchange::OrderSide;

// Re-export component configs that live next to their components
pub use crate::detector::tiers::{PollingTier, TierTable};
pub use crate::execution::circuit_breaker::CircuitBreakerConfig;
pub use crate::execution::retry::RetryStrategy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_api_secret")]
    pub api_secret: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: default_api_key(),
            api_secret: default_api_secret(),
            request_timeout_ms: default_request_timeout_ms(),
            recv_window_ms: default_recv_window_ms(),
        }
    }
}

/// Adaptive detector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Urgency tiers in declaration order (first match wins on overlap)
    #[serde(default = "default_tiers")]
    pub tiers: Vec<PollingTier>,
    /// How long past its launch time a listing may stay untradable
    /// before it is given up as MISSED
    #[serde(default = "default_missed_grace_ms")]
    pub missed_grace_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            missed_grace_ms: default_missed_grace_ms(),
        }
    }
}

/// Snipe execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Order size in quote currency (e.g. USDT)
    #[serde(default = "default_notional_amount")]
    pub notional_amount: f64,
    #[serde(default)]
    pub side: OrderSide,
    /// Skip order placement and synthesize fills
    #[serde(default)]
    pub test_mode: bool,
    /// Safety timeout for a single order attempt
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    #[serde(default)]
    pub retry: RetryStrategy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            notional_amount: default_notional_amount(),
            side: OrderSide::Buy,
            test_mode: false,
            max_execution_time_ms: default_max_execution_time_ms(),
            retry: RetryStrategy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            error_log_capacity: default_error_log_capacity(),
        }
    }
}

/// Post-execution P&L snapshot schedule
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offsets from execution time, in milliseconds
    #[serde(default = "default_tracking_offsets_ms")]
    pub offsets_ms: Vec<u64>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offsets_ms: default_tracking_offsets_ms(),
        }
    }
}

/// New-coin calendar polling
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_calendar_url")]
    pub calendar_url: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_discovery_interval_ms")]
    pub poll_interval_ms: u64,
    /// Regexes on the coin name; matching calendar entries are ignored
    #[serde(default = "default_skip_patterns")]
    pub skip_patterns: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            calendar_url: default_calendar_url(),
            quote_asset: default_quote_asset(),
            poll_interval_ms: default_discovery_interval_ms(),
            skip_patterns: default_skip_patterns(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// JSON snapshot of listings, targets and snipes
    #[serde(default)]
    pub state_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

// Default value functions
fn default_base_url() -> String {
    std::env::var("MEXC_BASE_URL").unwrap_or_else(|_| "https://api.mexc.com".into())
}

fn default_api_key() -> String {
    std::env::var("MEXC_API_KEY").unwrap_or_default()
}

fn default_api_secret() -> String {
    std::env::var("MEXC_API_SECRET").unwrap_or_default()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_tiers() -> Vec<PollingTier> {
    TierTable::default_tiers()
}

fn default_missed_grace_ms() -> u64 {
    10 * 60 * 1000
}

fn default_notional_amount() -> f64 {
    100.0
}

fn default_max_execution_time_ms() -> u64 {
    2000
}

fn default_error_log_capacity() -> usize {
    100
}

fn default_tracking_offsets_ms() -> Vec<u64> {
    vec![60_000, 300_000, 900_000, 3_600_000]
}

fn default_calendar_url() -> String {
    "https://www.mexc.com/api/operation/new_coin_calendar".into()
}

fn default_quote_asset() -> String {
    "USDT".into()
}

fn default_discovery_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_skip_patterns() -> Vec<String> {
    // Leveraged tokens
    vec![r"^\w+\d+[LS]$".into(), r"(UP|DOWN|BULL|BEAR)$".into()]
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SNIPER_)
            .add_source(
                config::Environment::with_prefix("SNIPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        TierTable::new(self.detector.tiers.clone()).context("Invalid detector.tiers")?;

        if self.execution.notional_amount <= 0.0 || !self.execution.notional_amount.is_finite() {
            anyhow::bail!("notional_amount must be positive");
        }

        if self.execution.max_execution_time_ms == 0 {
            anyhow::bail!("max_execution_time_ms must be positive");
        }

        if self.execution.error_log_capacity == 0 {
            anyhow::bail!("error_log_capacity must be positive");
        }

        self.execution
            .retry
            .validate()
            .context("Invalid execution.retry")?;

        if self.execution.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }

        if self.tracking.enabled {
            if self.tracking.offsets_ms.is_empty() {
                anyhow::bail!("tracking.offsets_ms cannot be empty when tracking is enabled");
            }
            if self.tracking.offsets_ms.iter().any(|o| *o == 0) {
                anyhow::bail!("tracking.offsets_ms must be positive");
            }
        }

        if self.discovery.enabled {
            if self.discovery.poll_interval_ms == 0 {
                anyhow::bail!("discovery.poll_interval_ms must be positive");
            }
            if self.discovery.quote_asset.is_empty() {
                anyhow::bail!("discovery.quote_asset cannot be empty");
            }
            for pattern in &self.discovery.skip_patterns {
                regex::Regex::new(pattern)
                    .with_context(|| format!("Invalid discovery.skip_patterns entry {:?}", pattern))?;
            }
        }

        if self.events.channel_capacity == 0 {
            anyhow::bail!("events.channel_capacity must be positive");
        }

        if !self.execution.test_mode && self.exchange.api_key.is_empty() {
            tracing::warn!("No API key configured - live order placement will fail");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let tiers = self
            .detector
            .tiers
            .iter()
            .map(|t| format!("    {}", t))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Configuration:
  Exchange:
    base_url: {}
    api_key: {}
    api_secret: {}
    request_timeout: {}ms
  Detector:
    missed_grace: {}ms
    tiers:
{}
  Execution:
    notional_amount: {}
    side: {}
    test_mode: {}
    max_execution_time: {}ms
    retry: max={} initial={}ms max_delay={}ms x{} jitter={}%
    circuit_breaker: threshold={} cooldown={}ms
  Tracking:
    enabled: {}
    offsets_ms: {:?}
  Discovery:
    enabled: {}
    calendar_url: {}
  Storage:
    state_path: {}
"#,
            mask_url(&self.exchange.base_url),
            mask_secret(&self.exchange.api_key),
            mask_secret(&self.exchange.api_secret),
            self.exchange.request_timeout_ms,
            self.detector.missed_grace_ms,
            tiers,
            self.execution.notional_amount,
            self.execution.side,
            self.execution.test_mode,
            self.execution.max_execution_time_ms,
            self.execution.retry.max_retries,
            self.execution.retry.initial_delay_ms,
            self.execution.retry.max_delay_ms,
            self.execution.retry.backoff_multiplier,
            self.execution.retry.jitter_percentage,
            self.execution.circuit_breaker.failure_threshold,
            self.execution.circuit_breaker.cooldown_ms,
            self.tracking.enabled,
            self.tracking.offsets_ms,
            self.discovery.enabled,
            mask_url(&self.discovery.calendar_url),
            self.storage.state_path.as_deref().unwrap_or("(in-memory)"),
        )
    }
}

fn mask_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(not set)"
    } else {
        "***"
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.error_log_capacity, 100);
        assert_eq!(config.tracking.offsets_ms.len(), 4);
        assert!(!config.execution.test_mode);
    }

    #[test]
    fn test_rejects_non_positive_notional() {
        let mut config = Config::default();
        config.execution.notional_amount = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_gapped_tiers() {
        let mut config = Config::default();
        config.detector.tiers = vec![
            PollingTier::new("NEAR", 0, Some(60_000), 1_000),
            PollingTier::new("FAR", 120_000, None, 60_000),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiers_deserialize_from_toml() {
        let toml = r#"
            [detector]
            missed_grace_ms = 1000

            [[detector.tiers]]
            name = "NEAR"
            min_ms = 0
            max_ms = 60000
            interval_ms = 1000

            [[detector.tiers]]
            name = "FAR"
            min_ms = 60000
            interval_ms = 30000
        "#;
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.detector.tiers.len(), 2);
        assert_eq!(config.detector.tiers[1].max_ms, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
        assert_eq!(mask_secret(""), "(not set)");
        assert_eq!(mask_secret("abc"), "***");
    }
}
