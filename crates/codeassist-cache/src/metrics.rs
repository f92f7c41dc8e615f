//! Process-wide cache counters
//!
//! Counters are updated alongside entry mutations and read without taking the
//! store lock, so a snapshot is eventually consistent. Everything is monotonic
//! except `size` and `storage_size`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    size: AtomicU64,
    total_entries: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    storage_size: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_size(&self, entries: usize) {
        self.size.store(entries as u64, Ordering::Relaxed);
    }

    pub fn set_storage_size(&self, bytes: u64) {
        self.storage_size.store(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        MetricsSnapshot {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            size: self.size.load(Ordering::Relaxed),
            total_entries: self.total_entries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            storage_size: self.storage_size.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup
    pub hit_rate: f64,
    /// Resident entries
    pub size: u64,
    /// Entries ever stored
    pub total_entries: u64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Bytes on disk (or estimated in-memory bytes without persistence)
    pub storage_size: u64,
}
