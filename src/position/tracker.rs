//! Post-execution P&L tracking
//!
//! For every executed snipe, one-shot timers fire at fixed offsets from the
//! execution time, fetch the current price and append the unrealized P&L to
//! the snipe record. Sessions can be stopped individually; a timer that
//! fires for a stopped session does nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::events::{EventBus, SniperEvent};
use crate::exchange::ExchangeClient;
use crate::registry::{PnlSnapshot, Snipe, TargetRegistry};
use crate::scheduler::TimerRegistry;

/// Live tracking state for one snipe
#[derive(Debug, Clone)]
pub struct TrackingSession {
    pub snipe_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub executed_at: DateTime<Utc>,
}

pub struct PositionTracker {
    offsets_ms: Vec<u64>,
    registry: Arc<TargetRegistry>,
    client: Arc<dyn ExchangeClient>,
    events: EventBus,
    /// Keyed by (snipe id, offset)
    timers: TimerRegistry<(String, u64)>,
    sessions: DashMap<String, TrackingSession>,
}

impl PositionTracker {
    pub fn new(
        config: &TrackingConfig,
        registry: Arc<TargetRegistry>,
        client: Arc<dyn ExchangeClient>,
        events: EventBus,
    ) -> Self {
        let mut offsets_ms = config.offsets_ms.clone();
        offsets_ms.sort_unstable();
        offsets_ms.dedup();
        Self {
            offsets_ms,
            registry,
            client,
            events,
            timers: TimerRegistry::new("tracker"),
            sessions: DashMap::new(),
        }
    }

    /// Schedule the P&L snapshots for an executed snipe.
    ///
    /// Offsets already in the past, or already recorded on the snipe, are
    /// skipped rather than fired late. Returns how many were scheduled.
    pub fn start_tracking(self: &Arc<Self>, snipe: &Snipe) -> usize {
        if !snipe.is_executed() || snipe.avg_price <= 0.0 {
            warn!(snipe_id = %snipe.id, status = %snipe.status, "Snipe has no entry price, not tracking");
            return 0;
        }
        if self.sessions.contains_key(&snipe.id) {
            debug!(snipe_id = %snipe.id, "Already tracking");
            return 0;
        }

        self.sessions.insert(
            snipe.id.clone(),
            TrackingSession {
                snipe_id: snipe.id.clone(),
                symbol: snipe.target_symbol.clone(),
                entry_price: snipe.avg_price,
                executed_at: snipe.executed_at,
            },
        );

        let now = Utc::now();
        let mut scheduled = 0;
        for &offset_ms in &self.offsets_ms {
            let label = offset_label(offset_ms);
            if snipe.pnl_at(&label).is_some() {
                continue;
            }
            let due = snipe.executed_at + chrono::Duration::milliseconds(offset_ms as i64);
            let Ok(delay) = (due - now).to_std() else {
                debug!(snipe_id = %snipe.id, offset = %label, "Snapshot time already passed, skipping");
                continue;
            };

            let tracker: Weak<Self> = Arc::downgrade(self);
            let snipe_id = snipe.id.clone();
            if self.timers.schedule_once((snipe.id.clone(), offset_ms), delay, move || async move {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.take_snapshot(&snipe_id, offset_ms).await;
                }
            }) {
                scheduled += 1;
            }
        }

        if scheduled == 0 {
            self.sessions.remove(&snipe.id);
        } else {
            info!(
                snipe_id = %snipe.id,
                symbol = %snipe.target_symbol,
                entry = snipe.avg_price,
                snapshots = scheduled,
                "Position tracking started"
            );
        }
        scheduled
    }

    /// Fetch the price and record P&L at `offset_ms`. No-op for a stopped session.
    pub async fn take_snapshot(&self, snipe_id: &str, offset_ms: u64) {
        let Some(session) = self.sessions.get(snipe_id).map(|s| s.value().clone()) else {
            debug!(snipe_id = %snipe_id, "Tracking stopped, snapshot skipped");
            return;
        };
        let label = offset_label(offset_ms);

        match self.client.get_price(&session.symbol).await {
            Ok(price) => {
                let pnl_percent = pnl_percent(session.entry_price, price);
                let snapshot = PnlSnapshot {
                    label: label.clone(),
                    offset_ms,
                    price,
                    pnl_percent,
                    taken_at: Utc::now(),
                };
                match self.registry.record_pnl(&session.symbol, snapshot.clone()) {
                    Ok(_) => {
                        info!(
                            symbol = %session.symbol,
                            offset = %label,
                            price,
                            "P&L {:+.2}%",
                            pnl_percent
                        );
                        self.events.emit(SniperEvent::PnlUpdated {
                            snipe_id: session.snipe_id.clone(),
                            symbol: session.symbol.clone(),
                            snapshot,
                            at: Utc::now(),
                        });
                    }
                    Err(e) => warn!(symbol = %session.symbol, "Could not record P&L: {}", e),
                }
            }
            Err(e) => warn!(symbol = %session.symbol, offset = %label, "Price fetch failed, snapshot skipped: {}", e),
        }

        // This timer's own slot is still registered while it runs
        let remaining = self
            .timers
            .active_keys()
            .iter()
            .filter(|(id, o)| id == snipe_id && *o != offset_ms)
            .count();
        if remaining == 0 {
            self.sessions.remove(snipe_id);
            debug!(snipe_id = %snipe_id, "Tracking complete");
        }
    }

    /// Cancel the pending snapshots of one snipe
    pub fn stop_tracking(&self, snipe_id: &str) -> usize {
        self.sessions.remove(snipe_id);
        let cancelled = self.timers.cancel_matching(|(id, _)| id == snipe_id);
        if cancelled > 0 {
            info!(snipe_id = %snipe_id, cancelled, "Position tracking stopped");
        }
        cancelled
    }

    pub fn stop_all(&self) -> usize {
        self.sessions.clear();
        self.timers.cancel_all()
    }

    pub fn is_tracking(&self, snipe_id: &str) -> bool {
        self.sessions.contains_key(snipe_id)
    }

    /// Pending snapshot timers across all sessions
    pub fn active_timeouts(&self) -> usize {
        self.timers.active_count()
    }

    pub fn sessions(&self) -> Vec<TrackingSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}

pub fn pnl_percent(entry: f64, current: f64) -> f64 {
    if entry == 0.0 {
        return 0.0;
    }
    (current - entry) / entry * 100.0
}

/// "1m", "15m", "1h", ...
pub fn offset_label(offset_ms: u64) -> String {
    const HOUR: u64 = 3_600_000;
    const MINUTE: u64 = 60_000;
    if offset_ms % HOUR == 0 {
        format!("{}h", offset_ms / HOUR)
    } else if offset_ms % MINUTE == 0 {
        format!("{}m", offset_ms / MINUTE)
    } else if offset_ms % 1000 == 0 {
        format!("{}s", offset_ms / 1000)
    } else {
        format!("{}ms", offset_ms)
    }
}
