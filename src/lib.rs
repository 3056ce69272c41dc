//! Listing Sniper Library
//!
//! Watches upcoming exchange listings with adaptive polling, fires a single
//! market order the moment a listing becomes tradable, and follows the
//! position with scheduled P&L snapshots.

pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod position;
pub mod registry;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
