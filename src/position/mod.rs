//! Post-execution position tracking

pub mod tracker;

pub use tracker::{offset_label, pnl_percent, PositionTracker, TrackingSession};
