//! Sniper service
//!
//! Owns the registry, detector, executor and tracker and connects them over
//! the event bus: a ready target is executed, an executed snipe is tracked,
//! and every state change is flushed to the state snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DiscoveryConfig};
use crate::detector::AdaptiveDetector;
use crate::error::{Error, Result};
use crate::events::{EventBus, SniperEvent};
use crate::exchange::rest::CalendarEntry;
use crate::exchange::{ExchangeClient, RestExchangeClient};
use crate::execution::{CircuitBreakerState, ExecutionOutcome, SnipeExecutor};
use crate::position::PositionTracker;
use crate::registry::{Listing, Target, TargetRegistry};
use crate::scheduler::TimerRegistry;

/// Where upcoming listings come from
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn upcoming_listings(&self) -> Result<Vec<Listing>>;
}

/// Exchange new-coin calendar
pub struct CalendarSource {
    client: Arc<RestExchangeClient>,
    calendar_url: String,
    quote_asset: String,
    skip_patterns: Vec<Regex>,
}

impl CalendarSource {
    pub fn new(client: Arc<RestExchangeClient>, config: &DiscoveryConfig) -> Result<Self> {
        let skip_patterns = config
            .skip_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Invalid skip pattern: {}", e)))?;

        Ok(Self {
            client,
            calendar_url: config.calendar_url.clone(),
            quote_asset: config.quote_asset.to_uppercase(),
            skip_patterns,
        })
    }

    /// Future, non-skipped entries as PENDING listings
    fn to_listings(&self, entries: Vec<CalendarEntry>, now: DateTime<Utc>) -> Vec<Listing> {
        entries
            .into_iter()
            .filter(|e| e.first_open_time > now)
            .filter(|e| {
                let coin = e.coin.to_uppercase();
                let skip = self.skip_patterns.iter().any(|p| p.is_match(&coin));
                if skip {
                    debug!(coin = %coin, "Calendar entry skipped by pattern");
                }
                !skip
            })
            .map(|e| {
                let symbol = format!("{}{}", e.coin, self.quote_asset);
                Listing::new(&e.vcoin_id, &symbol, e.first_open_time)
            })
            .collect()
    }
}

#[async_trait]
impl ListingSource for CalendarSource {
    async fn upcoming_listings(&self) -> Result<Vec<Listing>> {
        let entries = self.client.fetch_calendar(&self.calendar_url).await?;
        Ok(self.to_listings(entries, Utc::now()))
    }
}

/// Live timer and execution counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub active_intervals: usize,
    pub active_timeouts: usize,
    pub in_flight_executions: usize,
    pub error_log_size: usize,
}

pub struct SniperService {
    config: Config,
    registry: Arc<TargetRegistry>,
    client: Arc<dyn ExchangeClient>,
    events: EventBus,
    detector: Arc<AdaptiveDetector>,
    executor: Arc<SnipeExecutor>,
    tracker: Arc<PositionTracker>,
    discovery: Option<Arc<dyn ListingSource>>,
    discovery_timer: TimerRegistry<&'static str>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Dispatched executions; drained before the final snapshot
    executions: Mutex<JoinSet<()>>,
}

impl SniperService {
    pub fn new(
        config: Config,
        client: Arc<dyn ExchangeClient>,
        discovery: Option<Arc<dyn ListingSource>>,
    ) -> Result<Self> {
        let registry = Arc::new(TargetRegistry::new(
            config.storage.state_path.as_ref().map(PathBuf::from),
        ));
        let events = EventBus::new(config.events.channel_capacity);

        let detector = Arc::new(AdaptiveDetector::new(
            &config.detector,
            registry.clone(),
            client.clone(),
            events.clone(),
        )?);
        let executor = Arc::new(SnipeExecutor::new(
            config.execution.clone(),
            registry.clone(),
            events.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(
            &config.tracking,
            registry.clone(),
            client.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            registry,
            client,
            events,
            detector,
            executor,
            tracker,
            discovery,
            discovery_timer: TimerRegistry::new("discovery"),
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
            executions: Mutex::new(JoinSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn detector(&self) -> &Arc<AdaptiveDetector> {
        &self.detector
    }

    /// Load persisted state, wire the pipeline and start every loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.load().await?;

        // Subscribe before anything can emit
        let rx = self.events.subscribe();
        let service = Arc::clone(self);
        let token = self.shutdown.clone();
        let pump = tokio::spawn(async move { service.pump_events(rx, token).await });
        *lock(&self.pump) = Some(pump);

        self.resume().await;
        self.detector.start_monitoring().await;
        self.start_discovery();

        info!(
            test_mode = self.executor.is_test_mode(),
            listings = self.registry.listings().len(),
            "Sniper service started"
        );
        Ok(())
    }

    /// Start, then run until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;
        shutdown.cancelled().await;
        info!("Shutdown requested");
        self.stop_monitoring().await;

        // Nobody else may be writing the snapshot when the last one goes out
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("Event pump ended abnormally: {}", e);
            }
        }
        self.drain_executions().await;
        self.persist().await;
        Ok(())
    }

    /// Let every dispatched execution reach its terminal record
    async fn drain_executions(&self) {
        let mut executions = std::mem::take(&mut *lock(&self.executions));
        if !executions.is_empty() {
            info!(in_flight = executions.len(), "Waiting for in-flight executions");
        }
        while let Some(joined) = executions.join_next().await {
            if let Err(e) = joined {
                warn!("Execution task ended abnormally: {}", e);
            }
        }
    }

    /// Cancel every timer: tier loops, snapshot timers, discovery polling
    pub async fn stop_monitoring(&self) {
        self.discovery_timer.cancel_all();
        self.detector.stop_monitoring().await;
        let cancelled = self.tracker.stop_all();
        self.shutdown.cancel();
        info!(snapshot_timers = cancelled, "Monitoring stopped");
    }

    pub async fn add_listing(&self, listing: Listing) -> bool {
        self.detector.add_listing(listing).await
    }

    pub async fn execute_target(&self, target: &Target) -> ExecutionOutcome {
        self.executor.execute_snipe(target, self.client.as_ref()).await
    }

    pub async fn resource_usage(&self) -> ResourceUsage {
        ResourceUsage {
            active_intervals: self.detector.active_intervals() + self.discovery_timer.active_count(),
            active_timeouts: self.tracker.active_timeouts(),
            in_flight_executions: self.executor.in_flight(),
            error_log_size: self.executor.error_log_size().await,
        }
    }

    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.executor.circuit_state()
    }

    /// Pick up work interrupted by a restart
    async fn resume(self: &Arc<Self>) {
        let grace = ChronoDuration::milliseconds(self.config.detector.missed_grace_ms as i64);
        let now = Utc::now();

        for target in self.registry.targets() {
            if self.registry.get_snipe(&target.symbol).is_some() {
                continue;
            }
            if now - target.launch_time > grace {
                warn!(symbol = %target.symbol, "Unexecuted target is past its window, leaving it");
                continue;
            }
            info!(symbol = %target.symbol, "Resuming unexecuted target");
            self.dispatch(target);
        }

        if self.config.tracking.enabled {
            for snipe in self.registry.snipes().iter().filter(|s| s.is_executed()) {
                self.tracker.start_tracking(snipe);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, target: Target) {
        let service = Arc::clone(self);
        let mut executions = lock(&self.executions);
        while executions.try_join_next().is_some() {}
        executions.spawn(async move {
            let outcome = service.execute_target(&target).await;
            debug!(symbol = %target.symbol, success = outcome.success, "{}", outcome.message);
        });
    }

    async fn pump_events(
        self: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<SniperEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Event pump shutting down");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event pump lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: SniperEvent) {
        debug!(event = event.name(), "Handling event");
        match event {
            SniperEvent::TargetReady { target, .. } => {
                self.dispatch(target);
            }
            SniperEvent::SnipeExecuted { snipe, .. } => {
                if self.config.tracking.enabled {
                    self.tracker.start_tracking(&snipe);
                }
            }
            SniperEvent::SnipeFailed { snipe, .. } => {
                error!(
                    symbol = %snipe.target_symbol,
                    status = %snipe.status,
                    "Snipe failed: {}",
                    snipe.error.as_deref().unwrap_or("unknown error")
                );
            }
            SniperEvent::ListingDiscovered { .. }
            | SniperEvent::ListingMissed { .. }
            | SniperEvent::PnlUpdated { .. } => {}
        }
        self.persist().await;
    }

    async fn persist(&self) {
        if let Err(e) = self.registry.save().await {
            warn!("Failed to save state: {}", e);
        }
    }

    fn start_discovery(self: &Arc<Self>) {
        if self.discovery.is_none() {
            return;
        }
        let period = Duration::from_millis(self.config.discovery.poll_interval_ms);

        // First poll right away, then on the interval
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.poll_discovery().await;
        });

        let service = Arc::downgrade(self);
        self.discovery_timer.schedule_repeating("calendar", period, move || {
            let service = service.clone();
            async move {
                match service.upgrade() {
                    Some(s) => {
                        s.poll_discovery().await;
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        });
        info!(interval_ms = self.config.discovery.poll_interval_ms, "Listing discovery started");
    }

    /// Register every unseen upcoming listing. Returns how many were new.
    pub async fn poll_discovery(&self) -> usize {
        let Some(source) = &self.discovery else {
            return 0;
        };
        let listings = match source.upcoming_listings().await {
            Ok(listings) => listings,
            Err(e) => {
                warn!("Listing discovery failed: {}", e);
                return 0;
            }
        };

        let mut added = 0;
        for listing in listings {
            if self.detector.add_listing(listing).await {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "New listings discovered");
        }
        added
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Pattern;
    use crate::exchange::mock::{MockExchange, MockOrder};
    use crate::registry::{ListingStatus, SnipeStatus};

    struct StaticSource(Mutex<Vec<Listing>>);

    #[async_trait]
    impl ListingSource for StaticSource {
        async fn upcoming_listings(&self) -> Result<Vec<Listing>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.execution.test_mode = true;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_target_is_executed_and_tracked() {
        let exchange = Arc::new(MockExchange::new());
        exchange.list_symbol("NEWUSDT", true);
        exchange.set_price("NEWUSDT", 0.5);

        let service = Arc::new(SniperService::new(test_config(), exchange.clone(), None).unwrap());
        service.start().await.unwrap();
        service
            .add_listing(Listing::new("v1", "NEWUSDT", Utc::now() + ChronoDuration::seconds(20)))
            .await;

        tokio::time::sleep(Duration::from_secs(2)).await;

        let snipe = service.registry().get_snipe("NEWUSDT").unwrap();
        assert!(snipe.is_executed());
        assert_eq!(snipe.executed_qty, 200.0);
        assert_eq!(exchange.orders_placed(), 0);
        assert_eq!(
            service.registry().get_listing("v1").unwrap().status,
            ListingStatus::Sniped
        );

        let usage = service.resource_usage().await;
        assert_eq!(usage.active_intervals, 0);
        assert_eq!(usage.active_timeouts, 4);

        service.stop_monitoring().await;
        let usage = service.resource_usage().await;
        assert_eq!(usage.active_intervals, 0);
        assert_eq!(usage.active_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_clears_all_intervals() {
        let exchange = Arc::new(MockExchange::new());
        let source = Arc::new(StaticSource(Mutex::new(vec![
            Listing::new("v1", "AUSDT", Utc::now() + ChronoDuration::minutes(3)),
            Listing::new("v2", "BUSDT", Utc::now() + ChronoDuration::hours(4)),
        ])));

        let mut config = test_config();
        config.discovery.enabled = true;
        let service = Arc::new(
            SniperService::new(config, exchange, Some(source as Arc<dyn ListingSource>)).unwrap(),
        );
        service.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(service.registry().listings().len(), 2);
        // IMMINENT + DISTANT tier loops and the discovery loop
        assert_eq!(service.resource_usage().await.active_intervals, 3);

        service.stop_monitoring().await;
        assert_eq!(service.resource_usage().await, ResourceUsage::default());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_execution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // A READY target left over from a previous run
        let seed = TargetRegistry::new(Some(path.clone()));
        let listing = Listing::new("v1", "NEWUSDT", Utc::now());
        seed.insert_listing(listing.clone());
        let pattern = Pattern {
            active: true,
            price_scale: 4,
            quantity_scale: 2,
        };
        seed.promote("v1", Target::from_listing(&listing, pattern)).unwrap();
        seed.save().await.unwrap();

        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("NEWUSDT", 0.5);
        exchange.push_order(MockOrder::Slow(Duration::from_millis(300)));

        let mut config = Config::default();
        config.storage.state_path = Some(path.display().to_string());
        let service = Arc::new(SniperService::new(config, exchange.clone(), None).unwrap());

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        service.clone().run(shutdown).await.unwrap();

        assert_eq!(exchange.orders_placed(), 1);
        let restored = TargetRegistry::new(Some(path));
        restored.load().await.unwrap();
        assert_eq!(
            restored.get_snipe("NEWUSDT").unwrap().status,
            SnipeStatus::Executed
        );
    }

    #[test]
    fn test_calendar_entries_become_listings() {
        let rest = Arc::new(RestExchangeClient::new(Default::default()).unwrap());
        let source = CalendarSource::new(rest, &DiscoveryConfig::default()).unwrap();
        let now = Utc::now();
        let entry = |id: &str, coin: &str, offset_min: i64| CalendarEntry {
            vcoin_id: id.into(),
            coin: coin.into(),
            first_open_time: now + ChronoDuration::minutes(offset_min),
        };

        let listings = source.to_listings(
            vec![
                entry("v1", "NEW", 30),
                entry("v2", "OLD", -30),
                entry("v3", "BTC3L", 30),
                entry("v4", "ETHUP", 30),
            ],
            now,
        );

        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "v1");
        assert_eq!(listings[0].symbol, "NEWUSDT");
    }

    #[tokio::test]
    async fn test_discovery_skips_known_listings() {
        let exchange = Arc::new(MockExchange::new());
        let source = Arc::new(StaticSource(Mutex::new(vec![Listing::new(
            "v1",
            "AUSDT",
            Utc::now() + ChronoDuration::hours(2),
        )])));

        let service = SniperService::new(
            test_config(),
            exchange,
            Some(source.clone() as Arc<dyn ListingSource>),
        )
        .unwrap();
        assert_eq!(service.poll_discovery().await, 1);
        assert_eq!(service.poll_discovery().await, 0);

        source.0.lock().unwrap().push(Listing::new(
            "v2",
            "BUSDT",
            Utc::now() + ChronoDuration::hours(3),
        ));
        assert_eq!(service.poll_discovery().await, 1);
    }
}
