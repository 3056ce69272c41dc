//! Listing / target / snipe registry

pub mod store;
pub mod types;

pub use store::{ClaimOutcome, ExecutionClaim, TargetRegistry};
pub use types::{Listing, ListingStatus, PnlSnapshot, Snipe, SnipeStatus, Target};
