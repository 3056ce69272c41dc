//! Lifecycle events
//!
//! Emitted on a broadcast channel for whatever notification/analytics
//! consumers are attached. Emitting never fails: with no subscribers the
//! event is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::registry::{Listing, PnlSnapshot, Snipe, Target};

/// Lifecycle event, tagged with the emitting time
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SniperEvent {
    ListingDiscovered {
        listing: Listing,
        at: DateTime<Utc>,
    },
    TargetReady {
        target: Target,
        tier: String,
        at: DateTime<Utc>,
    },
    ListingMissed {
        listing: Listing,
        at: DateTime<Utc>,
    },
    SnipeExecuted {
        snipe: Snipe,
        at: DateTime<Utc>,
    },
    SnipeFailed {
        snipe: Snipe,
        at: DateTime<Utc>,
    },
    PnlUpdated {
        snipe_id: String,
        symbol: String,
        snapshot: PnlSnapshot,
        at: DateTime<Utc>,
    },
}

impl SniperEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SniperEvent::ListingDiscovered { .. } => "listing_discovered",
            SniperEvent::TargetReady { .. } => "target_ready",
            SniperEvent::ListingMissed { .. } => "listing_missed",
            SniperEvent::SnipeExecuted { .. } => "snipe_executed",
            SniperEvent::SnipeFailed { .. } => "snipe_failed",
            SniperEvent::PnlUpdated { .. } => "pnl_updated",
        }
    }
}

/// Cloneable handle to the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SniperEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SniperEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "Event emitted"),
            Err(_) => trace!(event = name, "Event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SniperEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Listing;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let listing = Listing::new("v1", "NEWUSDT", Utc::now());
        bus.emit(SniperEvent::ListingDiscovered {
            listing,
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "listing_discovered");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "listing_discovered");
        assert_eq!(json["listing"]["symbol"], "NEWUSDT");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(SniperEvent::ListingDiscovered {
            listing: Listing::new("v1", "NEWUSDT", Utc::now()),
            at: Utc::now(),
        });
    }
}
