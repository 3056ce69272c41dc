//! Bounded log of recent execution errors

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    /// Stage that failed, e.g. "price" or "order"
    pub source: &'static str,
    pub symbol: String,
    pub message: String,
}

/// Ring of the most recent errors; the oldest entry is evicted first
#[derive(Debug)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, source: &'static str, symbol: &str, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ErrorEntry {
            timestamp: Utc::now(),
            source,
            symbol: symbol.to_string(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_hundred() {
        let mut log = ErrorLog::default();
        for i in 0..120 {
            log.push("order", "NEWUSDT", format!("error {}", i));
        }

        assert_eq!(log.len(), 100);
        let entries = log.entries();
        assert_eq!(entries.first().unwrap().message, "error 20");
        assert_eq!(entries.last().unwrap().message, "error 119");
    }
}
