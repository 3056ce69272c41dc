//! Keyed timer registry
//!
//! Owns every live timer handle of a component (the detector's per-tier poll
//! loops, the tracker's deferred snapshots) so that cancellation is explicit
//! and countable. Nothing here is global: each component holds its own
//! registry and dropping the registry aborts whatever is still scheduled.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::debug;

struct TimerEntry {
    id: u64,
    handle: JoinHandle<()>,
}

impl TimerEntry {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Registry of cancellable timers indexed by `K`
pub struct TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    name: &'static str,
    timers: Arc<DashMap<K, TimerEntry>>,
    next_id: AtomicU64,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            timers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `tick` every `period`, first run one period from now.
    ///
    /// At most one timer per key: returns false if a live timer already
    /// holds the key. The loop ends when `tick` returns `Break`.
    pub fn schedule_repeating<F, Fut>(&self, key: K, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        self.insert_with(key, move || {
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tick().await.is_break() {
                        break;
                    }
                }
                // No-op if the callback already detached this slot
                timers.remove_if(&task_key, |_, e| e.id == id);
            })
        }, id)
    }

    /// Run `f` once after `delay`. Returns false if the key is taken.
    pub fn schedule_once<F, Fut>(&self, key: K, delay: Duration, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        self.insert_with(key, move || {
            tokio::spawn(async move {
                sleep(delay).await;
                f().await;
                timers.remove_if(&task_key, |_, e| e.id == id);
            })
        }, id)
    }

    /// Spawn and insert while holding the key's slot, so a fast-finishing
    /// task can only clean up after its own entry exists.
    fn insert_with<S>(&self, key: K, spawn: S, id: u64) -> bool
    where
        S: FnOnce() -> JoinHandle<()>,
    {
        match self.timers.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_live() {
                    return false;
                }
                debug!(registry = self.name, key = ?slot.key(), "Replacing finished timer");
                slot.insert(TimerEntry {
                    id,
                    handle: spawn(),
                });
                true
            }
            Entry::Vacant(slot) => {
                debug!(registry = self.name, key = ?slot.key(), "Timer scheduled");
                slot.insert(TimerEntry {
                    id,
                    handle: spawn(),
                });
                true
            }
        }
    }

    /// Abort and forget the timer for `key`
    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some((_, entry)) => {
                entry.handle.abort();
                debug!(registry = self.name, key = ?key, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer whose key matches. Returns how many were cancelled.
    pub fn cancel_matching<P>(&self, pred: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let keys: Vec<K> = self
            .timers
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.iter().filter(|k| self.cancel(k)).count()
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|_| true)
    }

    /// Forget the timer for `key` without aborting it.
    ///
    /// Used by a running loop that is about to end itself, so the slot can be
    /// re-scheduled immediately.
    pub fn detach(&self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.timers.get(key).map_or(false, |e| e.is_live())
    }

    /// Number of live timers
    pub fn active_count(&self) -> usize {
        self.timers.iter().filter(|e| e.is_live()).count()
    }

    pub fn active_keys(&self) -> Vec<K> {
        self.timers
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.key().clone())
            .collect()
    }
}

impl<K> Drop for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.handle.abort();
        }
    }
}
