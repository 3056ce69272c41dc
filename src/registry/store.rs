//! Target registry
//!
//! In-memory store of listings, targets and snipe records. The detector is
//! the only writer of listings/targets, the executor the only writer of
//! snipes. Every mutation touches a single key, so per-key `DashMap` locking
//! is all the synchronization needed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{Listing, ListingStatus, PnlSnapshot, Snipe, Target};
use crate::error::{Error, Result};

/// Execution slot for one target symbol
#[derive(Debug, Clone)]
enum SnipeSlot {
    /// Claimed by an executor that has not finished yet
    InFlight,
    /// Terminal, write-once
    Done(Snipe),
}

/// Result of trying to claim a target for execution
pub enum ClaimOutcome {
    Acquired(ExecutionClaim),
    AlreadyExecuted(Snipe),
    InProgress,
}

/// Exclusive right to write the snipe record for one symbol.
///
/// Completing the claim writes the terminal record. Dropping it unfinished
/// releases the symbol so a later attempt may run, unless an order may
/// already have reached the exchange: then the armed record is written
/// instead and the target can never be executed again.
pub struct ExecutionClaim {
    registry: Arc<TargetRegistry>,
    symbol: String,
    completed: bool,
    interrupted: Option<Snipe>,
}

impl ExecutionClaim {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Record to leave behind if the claim is dropped from here on
    pub fn arm(&mut self, interrupted: Snipe) {
        self.interrupted = Some(interrupted);
    }

    /// Write the terminal record. Consumes the claim.
    pub fn complete(mut self, snipe: Snipe) -> Snipe {
        self.registry
            .snipes
            .insert(self.symbol.clone(), SnipeSlot::Done(snipe.clone()));
        self.completed = true;
        snipe
    }
}

impl Drop for ExecutionClaim {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        match self.interrupted.take() {
            Some(snipe) => {
                warn!(
                    symbol = %self.symbol,
                    status = %snipe.status,
                    "Execution interrupted after order submission, target closed"
                );
                self.registry
                    .snipes
                    .insert(self.symbol.clone(), SnipeSlot::Done(snipe));
            }
            None => {
                self.registry
                    .snipes
                    .remove_if(&self.symbol, |_, slot| matches!(slot, SnipeSlot::InFlight));
                debug!(symbol = %self.symbol, "Execution claim released");
            }
        }
    }
}

/// On-disk snapshot
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    listings: Vec<Listing>,
    targets: Vec<Target>,
    snipes: Vec<Snipe>,
}

/// Registry of listings (by id), targets and snipes (by symbol)
pub struct TargetRegistry {
    listings: DashMap<String, Listing>,
    targets: DashMap<String, Target>,
    snipes: DashMap<String, SnipeSlot>,
    persistence_path: Option<PathBuf>,
    /// One writer of the snapshot file at a time
    save_lock: Mutex<()>,
}

impl TargetRegistry {
    /// Create a new registry
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            listings: DashMap::new(),
            targets: DashMap::new(),
            snipes: DashMap::new(),
            persistence_path,
            save_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Register a newly discovered listing. Returns false if the id is known.
    pub fn insert_listing(&self, listing: Listing) -> bool {
        match self.listings.entry(listing.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                info!(
                    id = %listing.id,
                    symbol = %listing.symbol,
                    launch = %listing.scheduled_launch_time,
                    "Listing registered"
                );
                v.insert(listing);
                true
            }
        }
    }

    pub fn get_listing(&self, id: &str) -> Option<Listing> {
        self.listings.get(id).map(|l| l.value().clone())
    }

    pub fn listings(&self) -> Vec<Listing> {
        let mut all: Vec<Listing> = self.listings.iter().map(|l| l.value().clone()).collect();
        all.sort_by_key(|l| l.scheduled_launch_time);
        all
    }

    pub fn pending_listings(&self) -> Vec<Listing> {
        self.listings()
            .into_iter()
            .filter(|l| l.status == ListingStatus::Pending)
            .collect()
    }

    /// Advance a listing's status. Refuses any non-forward transition.
    pub fn advance_listing(&self, id: &str, to: ListingStatus) -> Result<Listing> {
        let mut listing = self
            .listings
            .get_mut(id)
            .ok_or_else(|| Error::ListingNotFound(id.to_string()))?;

        if !listing.status.can_advance_to(to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: listing.status.to_string(),
                to: to.to_string(),
            });
        }

        debug!(id = %id, from = %listing.status, to = %to, "Listing status advanced");
        listing.status = to;
        Ok(listing.clone())
    }

    /// PENDING -> READY plus target creation, as one step.
    ///
    /// Returns false (and changes nothing) if the listing already left
    /// PENDING, so re-detection never creates a second target.
    pub fn promote(&self, listing_id: &str, target: Target) -> Result<bool> {
        let mut listing = self
            .listings
            .get_mut(listing_id)
            .ok_or_else(|| Error::ListingNotFound(listing_id.to_string()))?;

        if listing.status != ListingStatus::Pending {
            return Ok(false);
        }

        // The listing entry guard is held while the target is inserted
        listing.status = ListingStatus::Ready;
        self.targets.insert(target.symbol.clone(), target);
        Ok(true)
    }

    pub fn get_target(&self, symbol: &str) -> Option<Target> {
        self.targets.get(symbol).map(|t| t.value().clone())
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.iter().map(|t| t.value().clone()).collect()
    }

    /// Atomically check for an existing snipe and claim the symbol if free
    pub fn claim_execution(self: &Arc<Self>, symbol: &str) -> ClaimOutcome {
        match self.snipes.entry(symbol.to_string()) {
            Entry::Occupied(slot) => match slot.get() {
                SnipeSlot::Done(snipe) => ClaimOutcome::AlreadyExecuted(snipe.clone()),
                SnipeSlot::InFlight => ClaimOutcome::InProgress,
            },
            Entry::Vacant(v) => {
                v.insert(SnipeSlot::InFlight);
                ClaimOutcome::Acquired(ExecutionClaim {
                    registry: Arc::clone(self),
                    symbol: symbol.to_string(),
                    completed: false,
                    interrupted: None,
                })
            }
        }
    }

    pub fn get_snipe(&self, symbol: &str) -> Option<Snipe> {
        self.snipes.get(symbol).and_then(|slot| match slot.value() {
            SnipeSlot::Done(snipe) => Some(snipe.clone()),
            SnipeSlot::InFlight => None,
        })
    }

    pub fn snipes(&self) -> Vec<Snipe> {
        let mut all: Vec<Snipe> = self
            .snipes
            .iter()
            .filter_map(|slot| match slot.value() {
                SnipeSlot::Done(snipe) => Some(snipe.clone()),
                SnipeSlot::InFlight => None,
            })
            .collect();
        all.sort_by_key(|s| s.executed_at);
        all
    }

    /// Append a P&L snapshot to an executed snipe
    pub fn record_pnl(&self, symbol: &str, snapshot: PnlSnapshot) -> Result<Snipe> {
        let mut slot = self
            .snipes
            .get_mut(symbol)
            .ok_or_else(|| Error::Internal(format!("No snipe for {}", symbol)))?;

        match slot.value_mut() {
            SnipeSlot::Done(snipe) => {
                snipe.pnl.push(snapshot);
                Ok(snipe.clone())
            }
            SnipeSlot::InFlight => Err(Error::Internal(format!(
                "Snipe for {} still in flight",
                symbol
            ))),
        }
    }

    /// Load state from disk
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !Path::new(path).exists() {
            return Ok(());
        }

        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let snapshot: RegistrySnapshot =
            serde_json::from_str(&data).map_err(|e| Error::Persistence(e.to_string()))?;

        let counts = (
            snapshot.listings.len(),
            snapshot.targets.len(),
            snapshot.snipes.len(),
        );
        for listing in snapshot.listings {
            self.listings.insert(listing.id.clone(), listing);
        }
        for target in snapshot.targets {
            self.targets.insert(target.symbol.clone(), target);
        }
        for snipe in snapshot.snipes {
            self.snipes
                .insert(snipe.target_symbol.clone(), SnipeSlot::Done(snipe));
        }

        info!(
            "Loaded {} listings, {} targets, {} snipes from {}",
            counts.0,
            counts.1,
            counts.2,
            path.display()
        );
        Ok(())
    }

    /// Save state to disk
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;

        let snapshot = RegistrySnapshot {
            listings: self.listings(),
            targets: self.targets(),
            snipes: self.snipes(),
        };
        let data = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        // Write-then-rename so a crash never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!("Failed to move state snapshot into place: {}", e);
            return Err(Error::Persistence(e.to_string()));
        }

        debug!("Saved registry state to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::pattern::Pattern;
    use crate::exchange::OrderSide;
    use crate::registry::types::SnipeStatus;
    use chrono::{Duration, Utc};

    fn pattern() -> Pattern {
        Pattern {
            active: true,
            price_scale: 4,
            quantity_scale: 2,
        }
    }

    fn snipe(symbol: &str) -> Snipe {
        Snipe {
            id: "s1".into(),
            target_symbol: symbol.into(),
            status: SnipeStatus::Executed,
            side: OrderSide::Buy,
            executed_at: Utc::now(),
            requested_qty: 10.0,
            executed_qty: 10.0,
            avg_price: 1.0,
            order_id: Some("o1".into()),
            error: None,
            pnl: vec![],
        }
    }

    #[test]
    fn test_promote_is_single_transition() {
        let registry = TargetRegistry::in_memory();
        let listing = Listing::new("v1", "NEWUSDT", Utc::now() + Duration::minutes(5));
        assert!(registry.insert_listing(listing.clone()));
        assert!(!registry.insert_listing(listing.clone()));

        let target = Target::from_listing(&listing, pattern());
        assert!(registry.promote("v1", target.clone()).unwrap());
        assert!(!registry.promote("v1", target).unwrap());

        assert_eq!(registry.targets().len(), 1);
        assert_eq!(
            registry.get_listing("v1").unwrap().status,
            ListingStatus::Ready
        );
    }

    #[test]
    fn test_advance_refuses_backwards() {
        let registry = TargetRegistry::in_memory();
        registry.insert_listing(Listing::new("v1", "NEWUSDT", Utc::now()));

        registry.advance_listing("v1", ListingStatus::Missed).unwrap();
        assert!(registry
            .advance_listing("v1", ListingStatus::Ready)
            .is_err());
        assert!(registry
            .advance_listing("missing", ListingStatus::Ready)
            .is_err());
    }

    #[test]
    fn test_claim_is_exclusive_and_write_once() {
        let registry = Arc::new(TargetRegistry::in_memory());

        let claim = match registry.claim_execution("NEWUSDT") {
            ClaimOutcome::Acquired(c) => c,
            _ => panic!("first claim should succeed"),
        };
        assert!(matches!(
            registry.claim_execution("NEWUSDT"),
            ClaimOutcome::InProgress
        ));

        claim.complete(snipe("NEWUSDT"));
        match registry.claim_execution("NEWUSDT") {
            ClaimOutcome::AlreadyExecuted(s) => assert_eq!(s.id, "s1"),
            _ => panic!("completed claim should block re-execution"),
        }
    }

    #[test]
    fn test_dropped_claim_releases_symbol() {
        let registry = Arc::new(TargetRegistry::in_memory());
        {
            let _claim = match registry.claim_execution("NEWUSDT") {
                ClaimOutcome::Acquired(c) => c,
                _ => panic!("claim should succeed"),
            };
        }
        assert!(registry.get_snipe("NEWUSDT").is_none());
        assert!(matches!(
            registry.claim_execution("NEWUSDT"),
            ClaimOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_armed_claim_closes_target_when_dropped() {
        let registry = Arc::new(TargetRegistry::in_memory());
        {
            let mut claim = match registry.claim_execution("NEWUSDT") {
                ClaimOutcome::Acquired(c) => c,
                _ => panic!("claim should succeed"),
            };
            let mut interrupted = snipe("NEWUSDT");
            interrupted.status = SnipeStatus::TimedOut;
            claim.arm(interrupted);
        }

        assert_eq!(
            registry.get_snipe("NEWUSDT").unwrap().status,
            SnipeStatus::TimedOut
        );
        assert!(matches!(
            registry.claim_execution("NEWUSDT"),
            ClaimOutcome::AlreadyExecuted(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_leave_a_loadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let registry = Arc::new(TargetRegistry::new(Some(path.clone())));
        for i in 0..50 {
            registry.insert_listing(Listing::new(&format!("v{}", i), &format!("T{}USDT", i), Utc::now()));
        }

        let saves: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.save().await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let restored = TargetRegistry::new(Some(path));
        restored.load().await.unwrap();
        assert_eq!(restored.listings().len(), 50);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let registry = Arc::new(TargetRegistry::new(Some(path.clone())));
        let listing = Listing::new("v1", "NEWUSDT", Utc::now());
        registry.insert_listing(listing.clone());
        registry
            .promote("v1", Target::from_listing(&listing, pattern()))
            .unwrap();
        if let ClaimOutcome::Acquired(claim) = registry.claim_execution("NEWUSDT") {
            claim.complete(snipe("NEWUSDT"));
        }
        registry.save().await.unwrap();

        let restored = TargetRegistry::new(Some(path));
        restored.load().await.unwrap();
        assert_eq!(restored.listings().len(), 1);
        assert!(restored.get_target("NEWUSDT").is_some());
        assert!(restored.get_snipe("NEWUSDT").unwrap().is_executed());
    }
}
