use crate::models::{PerformanceSummary, TradeRecord};
use dashmap::DashMap;
use log::debug;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Content-derived identity of a trade list: count, first/last timestamps,
/// and the (sorted) symbol set. Trade lists are append-only, so two lists
/// agreeing on these are the same run output.
pub fn trade_list_key(trades: &[TradeRecord]) -> u64 {
    let mut hasher = DefaultHasher::new();
    trades.len().hash(&mut hasher);
    if let Some(first) = trades.first() {
        first.date.timestamp().hash(&mut hasher);
    }
    if let Some(last) = trades.last() {
        last.date.timestamp().hash(&mut hasher);
    }
    let symbols: BTreeSet<&str> = trades.iter().map(|trade| trade.symbol.as_str()).collect();
    for symbol in symbols {
        symbol.hash(&mut hasher);
    }
    hasher.finish()
}

/// Concurrent cache of computed summaries. Reads never mutate; population is
/// single-writer-wins through the map's entry API.
#[derive(Default)]
pub struct MetricsCache {
    entries: DashMap<u64, PerformanceSummary>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u64) -> Option<PerformanceSummary> {
        let hit = self.entries.get(&key).map(|entry| entry.clone());
        if hit.is_some() {
            debug!("metrics cache hit for key {:x}", key);
        }
        hit
    }

    /// Stores `summary` unless another writer got there first; either way the
    /// cached value is returned, so all callers observe the same result.
    pub fn insert_if_absent(&self, key: u64, summary: PerformanceSummary) -> PerformanceSummary {
        self.entries.entry(key).or_insert(summary).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
