//! Listing detection: tier table, readiness pattern and the adaptive poller

pub mod adaptive;
pub mod pattern;
pub mod tiers;

pub use adaptive::AdaptiveDetector;
pub use pattern::{Pattern, SymbolSnapshot};
pub use tiers::{PollingTier, TierTable};
