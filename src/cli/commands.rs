//! CLI command implementations

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dialoguer::Confirm;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeClient, RestExchangeClient};
use crate::registry::{Listing, TargetRegistry};
use crate::service::{CalendarSource, ListingSource, SniperService};

/// Start the sniper
pub async fn start(config: &Config, test_mode: bool, yes: bool) -> Result<()> {
    let mut config = config.clone();
    if test_mode {
        config.execution.test_mode = true;
    }

    if config.execution.test_mode {
        warn!("Running in TEST mode - orders are simulated, nothing is sent to the exchange");
    } else {
        if config.exchange.api_key.is_empty() || config.exchange.api_secret.is_empty() {
            anyhow::bail!("Live trading needs MEXC_API_KEY and MEXC_API_SECRET");
        }
        if !yes {
            let confirmed = Confirm::new()
                .with_prompt(format!(
                    "Start LIVE trading with {} {} per snipe? Orders cannot be undone.",
                    config.execution.notional_amount, config.discovery.quote_asset
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                info!("Start cancelled by user");
                return Ok(());
            }
        }
    }

    info!(
        "Notional: {} {}, side: {}, max retries: {}",
        config.execution.notional_amount,
        config.discovery.quote_asset,
        config.execution.side,
        config.execution.retry.max_retries
    );

    let rest = Arc::new(RestExchangeClient::new(config.exchange.clone())?);
    let discovery: Option<Arc<dyn ListingSource>> = if config.discovery.enabled {
        info!("Calendar discovery enabled: {}", config.discovery.calendar_url);
        Some(Arc::new(CalendarSource::new(rest.clone(), &config.discovery)?))
    } else {
        info!("Calendar discovery disabled - only stored or manually added listings are watched");
        None
    };

    let service = Arc::new(SniperService::new(config, rest, discovery)?);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    service.clone().run(shutdown).await?;

    let usage = service.resource_usage().await;
    info!(
        active_intervals = usage.active_intervals,
        active_timeouts = usage.active_timeouts,
        "Sniper stopped"
    );
    Ok(())
}

fn state_registry(config: &Config) -> Result<TargetRegistry> {
    let path = config
        .storage
        .state_path
        .as_ref()
        .context("storage.state_path is not configured")?;
    Ok(TargetRegistry::new(Some(PathBuf::from(path))))
}

/// Show listings, targets and snipes from the state snapshot
pub async fn status(config: &Config) -> Result<()> {
    let registry = state_registry(config)?;
    registry.load().await?;
    let now = Utc::now();

    println!("\n=== LISTINGS ===\n");
    let listings = registry.listings();
    if listings.is_empty() {
        println!("No listings.");
    }
    for listing in &listings {
        let remaining = listing.time_until_launch_ms(now);
        println!(
            "{:<14} {:<8} launch {} ({})",
            listing.symbol,
            listing.status.to_string(),
            listing.scheduled_launch_time.format("%Y-%m-%d %H:%M:%S UTC"),
            format_remaining(remaining)
        );
    }

    println!("\n=== SNIPES ===\n");
    let snipes = registry.snipes();
    if snipes.is_empty() {
        println!("No snipes.");
    }
    for snipe in &snipes {
        println!(
            "{:<14} {:<9} qty {} @ {} order {}",
            snipe.target_symbol,
            snipe.status.to_string(),
            snipe.executed_qty,
            snipe.avg_price,
            snipe.order_id.as_deref().unwrap_or("-")
        );
        if let Some(err) = &snipe.error {
            println!("    error: {}", err);
        }
        for pnl in &snipe.pnl {
            println!("    +{:<4} {:>+8.2}% @ {}", pnl.label, pnl.pnl_percent, pnl.price);
        }
    }

    println!(
        "\nTotals: {} listings, {} targets, {} snipes",
        listings.len(),
        registry.targets().len(),
        snipes.len()
    );
    Ok(())
}

fn format_remaining(ms: i64) -> String {
    let secs = ms.abs() / 1000;
    let text = if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    };
    if ms < 0 {
        format!("{} ago", text)
    } else {
        format!("in {}", text)
    }
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check exchange connectivity
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;
    let client = RestExchangeClient::new(config.exchange.clone())?;

    print!("Exchange symbols... ");
    let start = Instant::now();
    match client.get_tradable_symbols().await {
        Ok(symbols) => {
            let active = symbols.iter().filter(|s| s.is_active).count();
            println!(
                "OK ({}ms, {} symbols, {} trading)",
                start.elapsed().as_millis(),
                symbols.len(),
                active
            );
        }
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    let probe = format!("BTC{}", config.discovery.quote_asset.to_uppercase());
    print!("Price feed ({})... ", probe);
    let start = Instant::now();
    match client.get_price(&probe).await {
        Ok(price) => println!("OK ({}ms, {})", start.elapsed().as_millis(), price),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    if config.discovery.enabled {
        print!("Listing calendar... ");
        match client.fetch_calendar(&config.discovery.calendar_url).await {
            Ok(entries) => println!("OK ({} entries)", entries.len()),
            Err(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    } else {
        println!("Listing calendar... DISABLED");
    }

    print!("API credentials... ");
    if config.exchange.api_key.is_empty() || config.exchange.api_secret.is_empty() {
        if config.execution.test_mode {
            println!("NOT SET (test mode)");
        } else {
            println!("MISSING");
            all_healthy = false;
        }
    } else {
        println!("SET");
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}

/// Register a listing in the state snapshot for the next `start`
pub async fn add_listing(
    config: &Config,
    symbol: &str,
    launch: DateTime<Utc>,
    id: Option<String>,
) -> Result<()> {
    if launch <= Utc::now() {
        anyhow::bail!("Launch time {} is in the past", launch);
    }

    let registry = state_registry(config)?;
    registry.load().await?;

    let id = id.unwrap_or_else(|| format!("manual-{}", symbol.to_uppercase()));
    let listing = Listing::new(&id, symbol, launch);
    if !registry.insert_listing(listing) {
        anyhow::bail!("Listing {} already exists", id);
    }
    registry.save().await?;

    println!("Added {} ({}) launching {}", symbol.to_uppercase(), id, launch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(90_000), "in 1m30s");
        assert_eq!(format_remaining(-5_000), "5s ago");
        assert_eq!(format_remaining(2 * 3_600_000 + 60_000), "in 2h01m");
    }

    #[tokio::test]
    async fn test_add_listing_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.state_path = Some(dir.path().join("state.json").display().to_string());

        let launch = Utc::now() + chrono::Duration::hours(1);
        add_listing(&config, "newusdt", launch, None).await.unwrap();
        assert!(add_listing(&config, "newusdt", launch, None).await.is_err());

        let registry = state_registry(&config).unwrap();
        registry.load().await.unwrap();
        let listing = registry.get_listing("manual-NEWUSDT").unwrap();
        assert_eq!(listing.symbol, "NEWUSDT");
    }
}
