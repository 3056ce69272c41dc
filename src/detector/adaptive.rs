//! Adaptive-tier listing detector
//!
//! Every pending listing belongs to exactly one urgency tier, picked from its
//! time until launch. Each tier with members runs one poll loop at the tier's
//! interval; a loop refreshes the exchange symbol snapshot, promotes the
//! listings that became tradable, re-buckets the rest and stops itself once
//! its tier is empty.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::pattern::SymbolSnapshot;
use super::tiers::{PollingTier, TierTable};
use crate::config::DetectorConfig;
use crate::error::Result;
use crate::events::{EventBus, SniperEvent};
use crate::exchange::ExchangeClient;
use crate::registry::{Listing, ListingStatus, Target, TargetRegistry};
use crate::scheduler::TimerRegistry;

/// Tier membership of pending listings
#[derive(Default)]
struct TierState {
    /// listing id -> tier name
    tier_of: HashMap<String, String>,
    /// tier name -> listing ids
    members: HashMap<String, HashSet<String>>,
}

impl TierState {
    fn assign(&mut self, id: &str, tier: &str) -> bool {
        if self.tier_of.get(id).map(String::as_str) == Some(tier) {
            return false;
        }
        self.remove(id);
        self.tier_of.insert(id.to_string(), tier.to_string());
        self.members
            .entry(tier.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.tier_of.remove(id) {
            if let Some(set) = self.members.get_mut(&old) {
                set.remove(id);
                if set.is_empty() {
                    self.members.remove(&old);
                }
            }
        }
    }

    fn has_members(&self, tier: &str) -> bool {
        self.members.get(tier).map_or(false, |m| !m.is_empty())
    }
}

pub struct AdaptiveDetector {
    tiers: TierTable,
    missed_grace_ms: u64,
    registry: Arc<TargetRegistry>,
    client: Arc<dyn ExchangeClient>,
    events: EventBus,
    timers: TimerRegistry<String>,
    running: AtomicBool,
    state: Mutex<TierState>,
    failed_polls: AtomicU64,
}

impl AdaptiveDetector {
    pub fn new(
        config: &DetectorConfig,
        registry: Arc<TargetRegistry>,
        client: Arc<dyn ExchangeClient>,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            tiers: TierTable::new(config.tiers.clone())?,
            missed_grace_ms: config.missed_grace_ms,
            registry,
            client,
            events,
            timers: TimerRegistry::new("detector"),
            running: AtomicBool::new(false),
            state: Mutex::new(TierState::default()),
            failed_polls: AtomicU64::new(0),
        })
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Register a newly discovered listing and put it under watch
    pub async fn add_listing(self: &Arc<Self>, listing: Listing) -> bool {
        if !self.registry.insert_listing(listing.clone()) {
            debug!(id = %listing.id, "Listing already known");
            return false;
        }
        self.events.emit(SniperEvent::ListingDiscovered {
            listing,
            at: Utc::now(),
        });
        self.sync_tiers(Utc::now()).await;
        true
    }

    /// Bucket every pending listing and start the loops that are needed
    pub async fn start_monitoring(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(tiers = self.tiers.tiers().len(), "Detector monitoring started");
        self.sync_tiers(Utc::now()).await;
    }

    /// Cancel every poll loop
    pub async fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let cancelled = self.timers.cancel_all();
        *state = TierState::default();
        info!(cancelled, "Detector monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of live tier poll loops
    pub fn active_intervals(&self) -> usize {
        self.timers.active_count()
    }

    pub fn failed_polls(&self) -> u64 {
        self.failed_polls.load(Ordering::Relaxed)
    }

    /// Tier currently responsible for a listing
    pub async fn tier_of(&self, listing_id: &str) -> Option<String> {
        self.state.lock().await.tier_of.get(listing_id).cloned()
    }

    /// (tier, pending listings, loop running) in declaration order
    pub async fn tier_summary(&self) -> Vec<(String, usize, bool)> {
        let state = self.state.lock().await;
        self.tiers
            .tiers()
            .iter()
            .map(|t| {
                let n = state.members.get(&t.name).map_or(0, HashSet::len);
                (t.name.clone(), n, self.timers.is_active(&t.name))
            })
            .collect()
    }

    async fn sync_tiers(self: &Arc<Self>, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        self.reassign(&mut state, now);
        self.start_missing_loops(&state);
    }

    /// Re-bucket pending listings. Runs under the state lock, so a listing
    /// moves out of its old tier and into the new one in a single step.
    fn reassign(&self, state: &mut TierState, now: DateTime<Utc>) {
        let pending = self.registry.pending_listings();
        let pending_ids: HashSet<&str> = pending.iter().map(|l| l.id.as_str()).collect();

        let gone: Vec<String> = state
            .tier_of
            .keys()
            .filter(|id| !pending_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            state.remove(&id);
        }

        for listing in &pending {
            let remaining = listing.time_until_launch_ms(now);
            let Some(tier) = self.tiers.assign_tier(remaining) else {
                // Unreachable for a validated table
                warn!(symbol = %listing.symbol, remaining, "No tier covers listing");
                continue;
            };
            let previous = state.tier_of.get(&listing.id).cloned();
            if state.assign(&listing.id, &tier.name) {
                match previous {
                    Some(from) => info!(
                        symbol = %listing.symbol,
                        from = %from,
                        to = %tier.name,
                        "Listing moved to a more urgent tier"
                    ),
                    None => debug!(symbol = %listing.symbol, tier = %tier.name, "Listing assigned to tier"),
                }
            }
        }
    }

    fn start_missing_loops(self: &Arc<Self>, state: &TierState) {
        if !self.is_running() {
            return;
        }
        for tier in self.tiers.tiers() {
            if state.has_members(&tier.name) && !self.timers.is_active(&tier.name) {
                self.start_tier_loop(tier);
            }
        }
    }

    fn start_tier_loop(self: &Arc<Self>, tier: &PollingTier) {
        // Weak so the loop never keeps the detector alive on its own
        let detector = Arc::downgrade(self);
        let name = tier.name.clone();

        let started = self.timers.schedule_repeating(tier.name.clone(), tier.interval(), move || {
            let detector = detector.clone();
            let name = name.clone();
            async move {
                match detector.upgrade() {
                    Some(d) => d.run_tier_tick(&name, Utc::now()).await,
                    None => ControlFlow::Break(()),
                }
            }
        });
        if started {
            info!(tier = %tier, "Tier poll loop started");
        }
    }

    /// One evaluation of `tier`.
    ///
    /// Works on the membership snapshot taken at the start; a listing that
    /// crosses into another tier meanwhile is handed over at the end and
    /// picked up by that tier's next tick. Breaks when the tier is empty.
    pub async fn run_tier_tick(self: &Arc<Self>, tier: &str, now: DateTime<Utc>) -> ControlFlow<()> {
        let members: Vec<String> = {
            let state = self.state.lock().await;
            state
                .members
                .get(tier)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default()
        };

        if !members.is_empty() {
            match self.client.get_tradable_symbols().await {
                Ok(symbols) => {
                    self.evaluate_members(tier, &members, &SymbolSnapshot::new(&symbols), now)
                }
                Err(e) => {
                    // Nothing is known about the exchange, so nothing may be marked missed
                    self.failed_polls.fetch_add(1, Ordering::Relaxed);
                    warn!(tier = %tier, "Exchange state fetch failed, retrying next tick: {}", e);
                }
            }
        }

        let mut state = self.state.lock().await;
        self.reassign(&mut state, now);
        self.start_missing_loops(&state);

        if state.has_members(tier) {
            ControlFlow::Continue(())
        } else {
            // Released under the lock so a concurrent add sees the tier idle
            self.timers.detach(&tier.to_string());
            info!(tier = %tier, "Tier empty, poll loop stopping");
            ControlFlow::Break(())
        }
    }

    fn evaluate_members(
        &self,
        tier: &str,
        members: &[String],
        snapshot: &SymbolSnapshot,
        now: DateTime<Utc>,
    ) {
        for id in members {
            let Some(listing) = self.registry.get_listing(id) else {
                continue;
            };
            if listing.status != ListingStatus::Pending {
                continue;
            }

            match snapshot.ready_pattern(&listing.symbol) {
                Some(pattern) => self.promote(&listing, Target::from_listing(&listing, pattern), tier),
                None if self.is_missed(&listing, now) => self.mark_missed(&listing),
                None => {}
            }
        }
    }

    fn promote(&self, listing: &Listing, target: Target, tier: &str) {
        match self.registry.promote(&listing.id, target.clone()) {
            Ok(true) => {
                info!(
                    symbol = %target.symbol,
                    tier = %tier,
                    pattern = %target.pattern,
                    launch = %target.launch_time,
                    "Listing is tradable, target ready"
                );
                self.events.emit(SniperEvent::TargetReady {
                    target,
                    tier: tier.to_string(),
                    at: Utc::now(),
                });
            }
            Ok(false) => debug!(symbol = %listing.symbol, "Listing already promoted"),
            Err(e) => warn!(symbol = %listing.symbol, "Promotion failed: {}", e),
        }
    }

    fn is_missed(&self, listing: &Listing, now: DateTime<Utc>) -> bool {
        listing.time_until_launch_ms(now) < -(self.missed_grace_ms as i64)
    }

    fn mark_missed(&self, listing: &Listing) {
        match self.registry.advance_listing(&listing.id, ListingStatus::Missed) {
            Ok(listing) => {
                warn!(
                    symbol = %listing.symbol,
                    launch = %listing.scheduled_launch_time,
                    "Listing never became tradable, marked missed"
                );
                self.events.emit(SniperEvent::ListingMissed {
                    listing,
                    at: Utc::now(),
                });
            }
            Err(e) => debug!(symbol = %listing.symbol, "Could not mark missed: {}", e),
        }
    }
}
