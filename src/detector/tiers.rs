//! Urgency tiers
//!
//! Maps "time until launch" onto a named tier with its own poll interval.
//! Intervals are half-open `[min_ms, max_ms)`; the furthest tier is unbounded.
//! On overlap the first tier in declaration order wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// One urgency tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingTier {
    pub name: String,
    /// Inclusive lower bound on time until launch
    pub min_ms: u64,
    /// Exclusive upper bound; `None` means unbounded
    #[serde(default)]
    pub max_ms: Option<u64>,
    /// Poll period while the tier is active
    pub interval_ms: u64,
}

impl PollingTier {
    pub fn new(name: &str, min_ms: u64, max_ms: Option<u64>, interval_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            min_ms,
            max_ms,
            interval_ms,
        }
    }

    /// Does this tier cover the given time until launch?
    pub fn contains(&self, time_until_launch_ms: u64) -> bool {
        time_until_launch_ms >= self.min_ms
            && self.max_ms.map_or(true, |max| time_until_launch_ms < max)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl fmt::Display for PollingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_ms {
            Some(max) => write!(
                f,
                "{} [{}ms, {}ms) every {}ms",
                self.name, self.min_ms, max, self.interval_ms
            ),
            None => write!(
                f,
                "{} [{}ms, inf) every {}ms",
                self.name, self.min_ms, self.interval_ms
            ),
        }
    }
}

/// Validated, ordered tier list
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<PollingTier>,
}

impl TierTable {
    /// Validate a tier list.
    ///
    /// The tiers must cover `[0, inf)` without gaps: sorted by `min_ms` the
    /// first starts at zero, each one starts no later than the previous one
    /// ends, and exactly the furthest tier is unbounded. Overlaps are allowed
    /// but logged, since only the first declared tier can ever match there.
    pub fn new(tiers: Vec<PollingTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::Config("tier table is empty".into()));
        }

        for tier in &tiers {
            if tier.name.is_empty() {
                return Err(Error::Config("tier name cannot be empty".into()));
            }
            if tier.interval_ms == 0 {
                return Err(Error::Config(format!(
                    "tier {} has a zero interval",
                    tier.name
                )));
            }
            if matches!(tier.max_ms, Some(max) if max <= tier.min_ms) {
                return Err(Error::Config(format!("tier {} has an empty range", tier.name)));
            }
        }

        let mut names: Vec<&str> = tiers.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != tiers.len() {
            return Err(Error::Config("tier names must be unique".into()));
        }

        let mut sorted: Vec<&PollingTier> = tiers.iter().collect();
        sorted.sort_by_key(|t| t.min_ms);

        if sorted[0].min_ms != 0 {
            return Err(Error::Config(format!(
                "tiers must start at 0ms, first starts at {}ms",
                sorted[0].min_ms
            )));
        }

        // Furthest point covered so far; None once an unbounded tier is seen
        let mut covered_to = Some(0u64);
        for tier in &sorted {
            let Some(reach) = covered_to else {
                warn!(tier = %tier.name, "Tier is shadowed by an unbounded tier");
                continue;
            };
            if tier.min_ms > reach {
                return Err(Error::Config(format!(
                    "gap in tier table between {}ms and {}ms",
                    reach, tier.min_ms
                )));
            }
            if tier.min_ms < reach {
                warn!(tier = %tier.name, "Tier overlaps an earlier range; first declared wins");
            }
            covered_to = match tier.max_ms {
                Some(max) => Some(reach.max(max)),
                None => None,
            };
        }

        if covered_to.is_some() {
            return Err(Error::Config(
                "the furthest tier must be unbounded (omit max_ms)".into(),
            ));
        }

        Ok(Self { tiers })
    }

    /// LAUNCH < 1m, IMMINENT < 5m, APPROACHING < 60m, DISTANT beyond
    pub fn default_tiers() -> Vec<PollingTier> {
        vec![
            PollingTier::new("LAUNCH", 0, Some(60_000), 1_000),
            PollingTier::new("IMMINENT", 60_000, Some(300_000), 5_000),
            PollingTier::new("APPROACHING", 300_000, Some(3_600_000), 30_000),
            PollingTier::new("DISTANT", 3_600_000, None, 300_000),
        ]
    }

    /// First tier in declaration order covering the given time until launch.
    /// Negative inputs (launch already passed) map to the zero point.
    pub fn assign_tier(&self, time_until_launch_ms: i64) -> Option<&PollingTier> {
        let t = time_until_launch_ms.max(0) as u64;
        self.tiers.iter().find(|tier| tier.contains(t))
    }

    pub fn get(&self, name: &str) -> Option<&PollingTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn tiers(&self) -> &[PollingTier] {
        &self.tiers
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: Self::default_tiers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    #[test]
    fn test_default_table_is_valid() {
        assert!(TierTable::new(TierTable::default_tiers()).is_ok());
    }

    #[test]
    fn test_every_non_negative_time_maps_to_one_tier() {
        let table = TierTable::default();
        let samples = [
            0,
            1,
            MIN - 1,
            MIN,
            5 * MIN - 1,
            5 * MIN,
            60 * MIN - 1,
            60 * MIN,
            90 * MIN,
            30 * 24 * 60 * MIN,
        ];
        for t in samples {
            let matches = table
                .tiers()
                .iter()
                .filter(|tier| tier.contains(t as u64))
                .count();
            assert_eq!(matches, 1, "t={} matched {} tiers", t, matches);
            assert!(table.assign_tier(t).is_some());
        }
    }

    #[test]
    fn test_closer_tiers_poll_faster() {
        let table = TierTable::default();
        let mut ordered: Vec<&PollingTier> = table.tiers().iter().collect();
        ordered.sort_by_key(|t| t.min_ms);
        for pair in ordered.windows(2) {
            assert!(
                pair[0].interval_ms < pair[1].interval_ms,
                "{} should poll faster than {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn test_half_open_boundaries() {
        let table = TierTable::default();
        assert_eq!(table.assign_tier(60 * MIN).unwrap().name, "DISTANT");
        assert_eq!(table.assign_tier(60 * MIN - 1).unwrap().name, "APPROACHING");
        assert_eq!(table.assign_tier(90 * MIN).unwrap().name, "DISTANT");
        assert_eq!(table.assign_tier(0).unwrap().name, "LAUNCH");
    }

    #[test]
    fn test_overdue_maps_to_most_urgent() {
        let table = TierTable::default();
        assert_eq!(table.assign_tier(-5 * MIN).unwrap().name, "LAUNCH");
    }

    #[test]
    fn test_overlap_first_declared_wins() {
        let table = TierTable::new(vec![
            PollingTier::new("WIDE", 0, Some(120_000), 2_000),
            PollingTier::new("NARROW", 0, Some(60_000), 500),
            PollingTier::new("REST", 120_000, None, 10_000),
        ])
        .unwrap();
        assert_eq!(table.assign_tier(30_000).unwrap().name, "WIDE");
    }

    #[test]
    fn test_invalid_tables() {
        // gap
        assert!(TierTable::new(vec![
            PollingTier::new("A", 0, Some(10), 1),
            PollingTier::new("B", 20, None, 1),
        ])
        .is_err());
        // bounded top
        assert!(TierTable::new(vec![PollingTier::new("A", 0, Some(10), 1)]).is_err());
        // not starting at zero
        assert!(TierTable::new(vec![PollingTier::new("A", 5, None, 1)]).is_err());
        // zero interval
        assert!(TierTable::new(vec![PollingTier::new("A", 0, None, 0)]).is_err());
        // duplicate names
        assert!(TierTable::new(vec![
            PollingTier::new("A", 0, Some(10), 1),
            PollingTier::new("A", 10, None, 1),
        ])
        .is_err());
        assert!(TierTable::new(vec![]).is_err());
    }
}
