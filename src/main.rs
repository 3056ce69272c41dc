//! Listing Sniper - adaptive new-listing detector and one-shot executor
//!
//! # WARNING
//! - Live mode places real market orders. Only trade funds you can afford to lose.
//! - Fresh listings are extremely volatile; the first minutes often reverse hard.
//! - Other bots watch the same calendar. Being first is not guaranteed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// Use the library crate
use listing_sniper::cli::commands;
use listing_sniper::config::Config;

/// Listing Sniper - buys new exchange listings the moment they open
#[derive(Parser)]
#[command(name = "sniper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watching listings and sniping
    Start {
        /// Simulate orders instead of sending them
        #[arg(long)]
        test_mode: bool,

        /// Skip the live-trading confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show listings, snipes and P&L from the state file
    Status,

    /// Show current configuration (secrets masked)
    Config,

    /// Check exchange connectivity
    Health,

    /// Add an upcoming listing by hand
    AddListing {
        /// Trading symbol, e.g. NEWUSDT
        symbol: String,

        /// Launch time (RFC 3339, e.g. 2026-01-01T12:00:00Z)
        #[arg(long, value_parser = parse_launch)]
        launch: DateTime<Utc>,

        /// Listing id (defaults to manual-<SYMBOL>)
        #[arg(long)]
        id: Option<String>,
    },
}

fn parse_launch(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time: {}", e))
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("listing_sniper=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { test_mode, yes } => commands::start(&config, test_mode, yes).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
        Commands::AddListing { symbol, launch, id } => {
            commands::add_listing(&config, &symbol, launch, id).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
