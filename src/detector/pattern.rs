//! Readiness pattern
//!
//! Compact descriptor of a symbol's trading flags and scales, frozen into the
//! target at the moment the listing is confirmed tradable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::exchange::SymbolInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub active: bool,
    pub price_scale: u32,
    pub quantity_scale: u32,
}

impl Pattern {
    pub fn from_symbol(info: &SymbolInfo) -> Self {
        Self {
            active: info.is_active,
            price_scale: info.price_scale,
            quantity_scale: info.quantity_scale,
        }
    }

    /// Ready to trade right now
    pub fn is_ready(&self) -> bool {
        self.active
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/p{}/q{}",
            if self.active { "active" } else { "inactive" },
            self.price_scale,
            self.quantity_scale
        )
    }
}

/// Symbol lookup built once per exchange snapshot
pub struct SymbolSnapshot {
    by_symbol: HashMap<String, Pattern>,
}

impl SymbolSnapshot {
    pub fn new(symbols: &[SymbolInfo]) -> Self {
        Self {
            by_symbol: symbols
                .iter()
                .map(|s| (s.symbol.to_uppercase(), Pattern::from_symbol(s)))
                .collect(),
        }
    }

    /// Readiness predicate: the symbol is listed and trading.
    /// Returns the pattern to freeze into the target.
    pub fn ready_pattern(&self, symbol: &str) -> Option<Pattern> {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .copied()
            .filter(Pattern::is_ready)
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(symbol: &str, active: bool) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            is_active: active,
            price_scale: 6,
            quantity_scale: 2,
        }
    }

    #[test]
    fn test_ready_only_when_listed_and_active() {
        let snapshot = SymbolSnapshot::new(&[info("NEWUSDT", true), info("WAITUSDT", false)]);

        let pattern = snapshot.ready_pattern("newusdt").unwrap();
        assert_eq!(pattern.quantity_scale, 2);
        assert_eq!(pattern.to_string(), "active/p6/q2");

        assert!(snapshot.ready_pattern("WAITUSDT").is_none());
        assert!(snapshot.ready_pattern("GHOSTUSDT").is_none());
    }
}
