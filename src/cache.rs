use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::quotes::QuoteSeries;

/// A cached series plus the bookkeeping needed to answer "is this fresh".
/// Stale entries survive fetch failures so the chart degrades to the last
/// known good data instead of going blank.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub series: QuoteSeries,
    pub stored_at: Instant,
    pub stale: bool,
}

impl CacheEntry {
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        !self.stale && now.duration_since(self.stored_at) < ttl
    }
}

/// In-memory per-symbol series cache. Bounded by the symbol cap, so there is
/// no eviction beyond dropping symbols removed from the settings. The mutex
/// guards map operations only; no I/O happens under it. Callers supply `now`
/// so freshness is decidable without a real clock.
#[derive(Default)]
pub struct QuoteCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(symbol).cloned()
    }

    /// Store a freshly fetched series, overwriting unconditionally and
    /// clearing any staleness flag.
    pub fn put(&self, series: QuoteSeries, now: Instant) {
        let symbol = series.symbol.clone();
        self.entries.lock().unwrap().insert(
            symbol,
            CacheEntry {
                series,
                stored_at: now,
                stale: false,
            },
        );
    }

    /// Flag the entry as stale after a failed refresh. Returns whether an
    /// entry existed to flag.
    pub fn mark_stale(&self, symbol: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(symbol) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Drop entries for symbols no longer tracked by the settings.
    pub fn retain(&self, symbols: &[String]) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|symbol, _| symbols.iter().any(|s| s == symbol));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!("Evicted {} cached series for untracked symbols", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
