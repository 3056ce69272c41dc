//! Listing, target and snipe records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detector::pattern::Pattern;
use crate::exchange::OrderSide;

/// Listing lifecycle. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Pending,
    Ready,
    Sniped,
    Missed,
}

impl ListingStatus {
    fn rank(self) -> u8 {
        match self {
            ListingStatus::Pending => 0,
            ListingStatus::Ready => 1,
            ListingStatus::Sniped | ListingStatus::Missed => 2,
        }
    }

    /// Monotonic transition check
    pub fn can_advance_to(self, next: ListingStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingStatus::Pending => write!(f, "PENDING"),
            ListingStatus::Ready => write!(f, "READY"),
            ListingStatus::Sniped => write!(f, "SNIPED"),
            ListingStatus::Missed => write!(f, "MISSED"),
        }
    }
}

/// An upcoming listing discovered ahead of launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub symbol: String,
    pub scheduled_launch_time: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub status: ListingStatus,
}

impl Listing {
    pub fn new(id: &str, symbol: &str, scheduled_launch_time: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_uppercase(),
            scheduled_launch_time,
            discovered_at: Utc::now(),
            status: ListingStatus::Pending,
        }
    }

    /// Milliseconds until launch; negative once the launch time has passed
    pub fn time_until_launch_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.scheduled_launch_time - now).num_milliseconds()
    }
}

/// A listing confirmed tradable, frozen with its execution parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub symbol: String,
    pub vcoin_id: String,
    pub launch_time: DateTime<Utc>,
    pub price_scale: u32,
    pub quantity_scale: u32,
    /// Lead time between discovery and the scheduled launch
    pub hours_advance_notice: f64,
    pub pattern: Pattern,
    pub discovered_at: DateTime<Utc>,
}

impl Target {
    /// Freeze a listing at its readiness decision point
    pub fn from_listing(listing: &Listing, pattern: Pattern) -> Self {
        let notice_ms = (listing.scheduled_launch_time - listing.discovered_at).num_milliseconds();
        Self {
            symbol: listing.symbol.clone(),
            vcoin_id: listing.id.clone(),
            launch_time: listing.scheduled_launch_time,
            price_scale: pattern.price_scale,
            quantity_scale: pattern.quantity_scale,
            hours_advance_notice: notice_ms.max(0) as f64 / 3_600_000.0,
            pattern,
            discovered_at: listing.discovered_at,
        }
    }
}

/// Terminal outcome of a snipe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnipeStatus {
    Executed,
    Failed,
    TimedOut,
}

impl fmt::Display for SnipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnipeStatus::Executed => write!(f, "EXECUTED"),
            SnipeStatus::Failed => write!(f, "FAILED"),
            SnipeStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Unrealized P&L measured at a fixed offset after execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    /// Human label of the offset, e.g. "5m"
    pub label: String,
    pub offset_ms: u64,
    pub price: f64,
    pub pnl_percent: f64,
    pub taken_at: DateTime<Utc>,
}

/// Record of the single execution attempt for a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snipe {
    pub id: String,
    pub target_symbol: String,
    pub status: SnipeStatus,
    pub side: OrderSide,
    pub executed_at: DateTime<Utc>,
    pub requested_qty: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pnl: Vec<PnlSnapshot>,
}

impl Snipe {
    pub fn is_executed(&self) -> bool {
        self.status == SnipeStatus::Executed
    }

    /// Snapshot taken at the given offset, if any
    pub fn pnl_at(&self, label: &str) -> Option<&PnlSnapshot> {
        self.pnl.iter().find(|p| p.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_listing_status_is_monotonic() {
        use ListingStatus::*;
        assert!(Pending.can_advance_to(Ready));
        assert!(Pending.can_advance_to(Missed));
        assert!(Ready.can_advance_to(Sniped));
        assert!(Ready.can_advance_to(Missed));
        assert!(!Ready.can_advance_to(Pending));
        assert!(!Ready.can_advance_to(Ready));
        assert!(!Sniped.can_advance_to(Missed));
        assert!(!Missed.can_advance_to(Ready));
    }

    #[test]
    fn test_target_freezes_listing() {
        let now = Utc::now();
        let mut listing = Listing::new("v1", "newusdt", now + Duration::hours(3));
        listing.discovered_at = now;

        let pattern = Pattern {
            active: true,
            price_scale: 5,
            quantity_scale: 1,
        };
        let target = Target::from_listing(&listing, pattern);

        assert_eq!(target.symbol, "NEWUSDT");
        assert_eq!(target.vcoin_id, "v1");
        assert_eq!(target.quantity_scale, 1);
        assert!((target.hours_advance_notice - 3.0).abs() < 1e-6);
    }
}
