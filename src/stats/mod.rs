//! Traffic counters
//!
//! Named monotonic counters shared by every loop. Counter names are
//! static strings so hot paths never allocate for a bump.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Shared counter table, keyed by name
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<BTreeMap<&'static str, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one, creating it at zero first if needed.
    pub fn incr(&self, counter: &'static str) {
        *self.counters.lock().unwrap().entry(counter).or_insert(0) += 1;
    }

    /// Current value of a counter, zero if never bumped.
    pub fn get(&self, counter: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(counter)
            .copied()
            .unwrap_or(0)
    }

    /// Point-in-time copy of every counter, sorted by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(&name, &value)| (name, value))
            .collect()
    }

    /// One-line rendering for periodic telemetry logging.
    pub fn render(&self) -> String {
        let parts: Vec<String> = self
            .snapshot()
            .into_iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();
        parts.join(", ")
    }
}
