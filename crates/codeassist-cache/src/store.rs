//! In-memory entry table
//!
//! All mutations, including the staleness removal performed by a lookup and
//! the disk save that follows a mutation, run inside one async critical
//! section per store.

use crate::clock::ClockHandle;
use crate::entry::{dependency_matches, CacheEntry, CacheValue, EntryMeta};
use crate::fingerprint::CacheKey;
use crate::metrics::CacheMetrics;
use crate::persistence::DiskPersistence;
use codeassist_core::{CacheOptions, Timestamp};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type EntryMap<V> = HashMap<CacheKey, CacheEntry<V>>;

/// Outcome of a store lookup
#[derive(Clone, Debug)]
pub enum Lookup<V> {
    /// Snapshot of the stored value plus the entry metadata after this access
    Hit(V, EntryMeta),
    Miss,
    /// The entry existed but was stale and has been removed
    Stale(StaleReason),
}

impl<V> Lookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Hit(value, _) => Some(value),
            Self::Miss | Self::Stale(_) => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(..))
    }
}

/// Why an entry was found stale
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StaleReason {
    Expired,
    DependencyChanged(PathBuf),
}

pub struct EntryStore<V> {
    entries: Mutex<EntryMap<V>>,
    max_entries: usize,
    max_storage_bytes: u64,
    ttl: Duration,
    persistence: Option<DiskPersistence>,
    metrics: Arc<CacheMetrics>,
    clock: ClockHandle,
}

impl<V: CacheValue> EntryStore<V> {
    pub fn new(
        options: &CacheOptions,
        persistence: Option<DiskPersistence>,
        metrics: Arc<CacheMetrics>,
        clock: ClockHandle,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: options.max_entries,
            max_storage_bytes: options.max_storage_bytes,
            ttl: options.ttl,
            persistence,
            metrics,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Populate from disk. Returns the number of entries now resident.
    pub async fn load(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let Some(persistence) = &self.persistence else {
            return entries.len();
        };

        let outcome = persistence.load::<V>(self.ttl, self.clock.now()).await;
        let mut loaded = outcome.entries;

        // The capacity may have shrunk since the entries were written.
        if loaded.len() > self.max_entries {
            loaded.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
            let dropped = loaded.len() - self.max_entries;
            loaded.truncate(self.max_entries);
            self.metrics.record_evictions(dropped as u64);
        }

        for entry in loaded {
            entries.insert(entry.key, entry);
        }

        let shed = shed_oldest(&mut entries, self.max_storage_bytes, None);
        if shed > 0 {
            tracing::info!(evicted = shed, limit = self.max_storage_bytes, "Loaded entries exceed the storage ceiling");
            self.metrics.record_evictions(shed as u64);
        }

        let dirty = outcome.expired > 0 || outcome.skipped > 0 || shed > 0;
        if dirty {
            self.commit(&entries).await;
        } else {
            self.metrics.set_size(entries.len());
            self.metrics
                .set_storage_size(persistence.storage_size().await);
        }
        entries.len()
    }

    /// Look up `key`, returning a copy of the stored value on a hit.
    ///
    /// Expired entries and entries with a modified dependency are removed and
    /// reported as stale, which counts as a miss plus an invalidation.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup<V> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();

        let Some(entry) = entries.get(key) else {
            self.metrics.record_miss();
            return Lookup::Miss;
        };

        let stale = if entry.is_expired(self.ttl, now) {
            Some(StaleReason::Expired)
        } else {
            changed_dependency(entry)
                .await
                .map(StaleReason::DependencyChanged)
        };

        if let Some(reason) = stale {
            tracing::debug!(key = %key, reason = ?reason, "Dropping stale cache entry");
            entries.remove(key);
            self.metrics.record_invalidations(1);
            self.metrics.record_miss();
            self.commit(&entries).await;
            return Lookup::Stale(reason);
        }

        let Some(entry) = entries.get_mut(key) else {
            self.metrics.record_miss();
            return Lookup::Miss;
        };
        entry.touch(now);
        self.metrics.record_hit();
        Lookup::Hit(entry.value.clone(), entry.meta())
    }

    /// Insert or replace the entry for `key`, evicting the least recently used
    /// entry first if the store is full.
    ///
    /// Afterwards the oldest entries are evicted until the table fits into
    /// `max_storage_bytes` again. The new entry itself is always kept.
    pub async fn insert(&self, key: CacheKey, value: V, file_dependencies: Vec<PathBuf>) {
        if self.max_entries == 0 {
            tracing::debug!(key = %key, "Cache capacity is zero, not storing");
            return;
        }

        let mut entries = self.entries.lock().await;
        let entry = CacheEntry::new(key, value, file_dependencies, self.clock.now());

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            if let Some(victim) = least_recently_used(&entries) {
                tracing::debug!(key = %victim, "Evicting least recently used entry");
                entries.remove(&victim);
                self.metrics.record_evictions(1);
            }
        }

        entries.insert(key, entry);
        self.metrics.record_stored();

        let shed = shed_oldest(&mut entries, self.max_storage_bytes, Some(key));
        if shed > 0 {
            tracing::debug!(evicted = shed, limit = self.max_storage_bytes, "Storage ceiling reached");
            self.metrics.record_evictions(shed as u64);
        }
        self.commit(&entries).await;
    }

    /// Fresh value for `key` without touching the entry or counting an access
    pub async fn peek(&self, key: &CacheKey) -> Option<V> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        if entry.is_expired(self.ttl, self.clock.now()) || changed_dependency(entry).await.is_some() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn remove(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return false;
        }
        self.metrics.record_invalidations(1);
        self.commit(&entries).await;
        true
    }

    /// Remove every entry whose dependency list satisfies `predicate`
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&[PathBuf]) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !predicate(&entry.file_dependencies));
        let removed = before - entries.len();

        if removed > 0 {
            self.metrics.record_invalidations(removed as u64);
            self.commit(&entries).await;
        }
        removed
    }

    /// Remove entries depending on any of `paths` (or on files beneath them)
    pub async fn remove_dependents(&self, paths: &[PathBuf]) -> usize {
        self.remove_where(|deps| {
            deps.iter()
                .any(|dep| paths.iter().any(|changed| dependency_matches(dep, changed)))
        })
        .await
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        self.metrics.record_invalidations(removed as u64);
        self.commit(&entries).await;
        removed
    }

    /// Remove entries older than `max_age`
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(max_age, now));
        let removed = before - entries.len();

        if removed > 0 {
            self.metrics.record_invalidations(removed as u64);
            self.commit(&entries).await;
        }
        removed
    }

    /// Evict the oldest entries until the stored bytes fit into `max_bytes`
    pub async fn evict_oldest_until(&self, max_bytes: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let evicted = shed_oldest(&mut entries, max_bytes, None);
        if evicted > 0 {
            self.metrics.record_evictions(evicted as u64);
            self.commit(&entries).await;
        }
        evicted
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes on disk, or the summed entry sizes when nothing is persisted
    pub async fn storage_size(&self) -> u64 {
        match &self.persistence {
            Some(persistence) => persistence.storage_size().await,
            None => {
                let entries = self.entries.lock().await;
                in_memory_size(&entries)
            }
        }
    }

    /// Publish the new size and write the table through to disk.
    ///
    /// Called with the lock held so that saves never interleave.
    async fn commit(&self, entries: &EntryMap<V>) {
        self.metrics.set_size(entries.len());
        let stored = match &self.persistence {
            Some(persistence) => match persistence.save(entries).await {
                Some(bytes) => bytes,
                None => return,
            },
            None => in_memory_size(entries),
        };
        self.metrics.set_storage_size(stored);
    }
}

fn in_memory_size<V>(entries: &EntryMap<V>) -> u64 {
    entries.values().map(|e| e.size_bytes).sum()
}

/// Drop the oldest-created entries, never `keep`, until the summed entry
/// sizes fit into `max_bytes`. Returns how many were dropped.
fn shed_oldest<V>(entries: &mut EntryMap<V>, max_bytes: u64, keep: Option<CacheKey>) -> usize {
    let mut total = in_memory_size(entries);
    if total <= max_bytes {
        return 0;
    }

    let mut by_age: Vec<(Timestamp, CacheKey, u64)> = entries
        .values()
        .filter(|e| Some(e.key) != keep)
        .map(|e| (e.created_at, e.key, e.size_bytes))
        .collect();
    by_age.sort();

    let mut dropped = 0;
    for (_, key, size) in by_age {
        if total <= max_bytes {
            break;
        }
        entries.remove(&key);
        total = total.saturating_sub(size);
        dropped += 1;
    }
    dropped
}

/// Ties resolve to whichever entry iteration reaches first.
fn least_recently_used<V>(entries: &EntryMap<V>) -> Option<CacheKey> {
    entries
        .values()
        .min_by_key(|e| e.last_accessed)
        .map(|e| e.key)
}

/// First dependency modified after the entry was created.
///
/// Stat failures count as unchanged.
async fn changed_dependency<V>(entry: &CacheEntry<V>) -> Option<PathBuf> {
    for dep in &entry.file_dependencies {
        let modified = match tokio::fs::metadata(dep).await.and_then(|m| m.modified()) {
            Ok(modified) => Timestamp::from_system_time(modified),
            Err(e) => {
                tracing::trace!(path = %dep.display(), error = %e, "Dependency stat failed, assuming unchanged");
                continue;
            }
        };
        if modified > entry.created_at {
            return Some(dep.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::fingerprint::fingerprint_value;
    use filetime::FileTime;
    use serde_json::json;
    use std::path::Path;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn key(n: u32) -> CacheKey {
        fingerprint_value(&json!({ "prompt": n }))
    }

    fn store_with(
        max_entries: usize,
        ttl: Duration,
        persistence: Option<DiskPersistence>,
    ) -> (EntryStore<String>, ManualClock, Arc<CacheMetrics>) {
        let clock = ManualClock::new(Timestamp(1_000_000));
        let metrics = Arc::new(CacheMetrics::new());
        let options = CacheOptions {
            max_entries,
            ttl,
            ..Default::default()
        };
        let store = EntryStore::new(&options, persistence, metrics.clone(), Arc::new(clock.clone()));
        (store, clock, metrics)
    }

    fn set_mtime(path: &Path, at: Timestamp) {
        let time = UNIX_EPOCH + Duration::from_millis(at.0);
        filetime::set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
    }

    #[tokio::test]
    async fn test_lookup_returns_copy_and_touches() {
        let (store, clock, metrics) = store_with(10, Duration::from_secs(60), None);
        store.insert(key(1), "value".to_string(), Vec::new()).await;

        clock.advance(Duration::from_millis(10));
        let Lookup::Hit(mut value, meta) = store.lookup(&key(1)).await else {
            panic!("expected hit");
        };
        value.push_str(" mutated");

        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_accessed, Timestamp(1_000_010));
        assert_eq!(store.lookup(&key(1)).await.into_value().unwrap(), "value");
        assert_eq!(metrics.snapshot().hits, 2);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let ttl = Duration::from_millis(1_000);
        let (store, clock, metrics) = store_with(10, ttl, None);
        store.insert(key(1), "v".to_string(), Vec::new()).await;

        clock.advance(Duration::from_millis(999));
        assert!(store.lookup(&key(1)).await.is_hit());

        clock.advance(Duration::from_millis(2));
        assert!(matches!(
            store.lookup(&key(1)).await,
            Lookup::Stale(StaleReason::Expired)
        ));
        assert!(!store.contains(&key(1)).await);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.invalidations, 1);
        assert_eq!(snapshot.size, 0);
    }

    #[tokio::test]
    async fn test_dependency_change_invalidates() {
        let temp_dir = TempDir::new().unwrap();
        let dep = temp_dir.path().join("lib.rs");
        std::fs::write(&dep, "fn a() {}").unwrap();

        let (store, clock, metrics) = store_with(10, Duration::from_secs(60), None);
        set_mtime(&dep, Timestamp(999_000));
        store.insert(key(1), "v".to_string(), vec![dep.clone()]).await;

        assert!(store.lookup(&key(1)).await.is_hit());

        std::fs::write(&dep, "fn b() {}").unwrap();
        clock.advance(Duration::from_millis(5));
        set_mtime(&dep, clock.now());

        assert_eq!(
            store.lookup(&key(1)).await.into_value(),
            None,
            "modified dependency must miss"
        );
        assert_eq!(metrics.snapshot().invalidations, 1);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_open() {
        let (store, _clock, _metrics) = store_with(10, Duration::from_secs(60), None);
        let dep = PathBuf::from("/definitely/not/here.rs");
        store.insert(key(1), "v".to_string(), vec![dep]).await;

        assert!(store.lookup(&key(1)).await.is_hit());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (store, clock, metrics) = store_with(3, Duration::from_secs(60), None);
        for n in 0..3 {
            store.insert(key(n), format!("v{n}"), Vec::new()).await;
            clock.advance(Duration::from_millis(10));
        }

        // Key 0 is the oldest insert but the most recently read.
        assert!(store.lookup(&key(0)).await.is_hit());
        clock.advance(Duration::from_millis(10));

        store.insert(key(3), "v3".to_string(), Vec::new()).await;

        assert_eq!(store.len().await, 3);
        assert!(store.contains(&key(0)).await);
        assert!(!store.contains(&key(1)).await);
        assert!(store.contains(&key(3)).await);
        assert_eq!(metrics.snapshot().evictions, 1);
        assert_eq!(metrics.snapshot().total_entries, 4);
    }

    #[tokio::test]
    async fn test_replacing_does_not_evict() {
        let (store, _clock, metrics) = store_with(2, Duration::from_secs(60), None);
        store.insert(key(1), "a".to_string(), Vec::new()).await;
        store.insert(key(2), "b".to_string(), Vec::new()).await;
        store.insert(key(2), "c".to_string(), Vec::new()).await;

        assert_eq!(store.len().await, 2);
        assert_eq!(metrics.snapshot().evictions, 0);
        assert_eq!(store.lookup(&key(2)).await.into_value().unwrap(), "c");
    }

    #[tokio::test]
    async fn test_zero_capacity_stores_nothing() {
        let (store, _clock, _metrics) = store_with(0, Duration::from_secs(60), None);
        store.insert(key(1), "a".to_string(), Vec::new()).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_dependents() {
        let (store, _clock, metrics) = store_with(10, Duration::from_secs(60), None);
        store
            .insert(key(1), "a".to_string(), vec![PathBuf::from("/ws/src/a.rs")])
            .await;
        store
            .insert(key(2), "b".to_string(), vec![PathBuf::from("/ws/src/b.rs")])
            .await;
        store
            .insert(key(3), "c".to_string(), vec![PathBuf::from("/ws/lib/c.rs")])
            .await;
        store.insert(key(4), "d".to_string(), Vec::new()).await;

        let removed = store
            .remove_dependents(&[PathBuf::from("/ws/src/a.rs")])
            .await;
        assert_eq!(removed, 1);

        let removed = store.remove_dependents(&[PathBuf::from("/ws/lib")]).await;
        assert_eq!(removed, 1);

        assert!(store.contains(&key(2)).await);
        assert!(store.contains(&key(4)).await);
        assert_eq!(metrics.snapshot().invalidations, 2);
    }

    #[tokio::test]
    async fn test_purge_and_evict_oldest() {
        let (store, clock, metrics) = store_with(10, Duration::from_secs(600), None);
        for n in 0..4 {
            store.insert(key(n), "x".repeat(100), Vec::new()).await;
            clock.advance(Duration::from_secs(10));
        }

        // Entries are now 40s, 30s, 20s and 10s old.
        assert_eq!(store.purge_older_than(Duration::from_secs(35)).await, 1);
        assert!(!store.contains(&key(0)).await);

        let per_entry = store.storage_size().await / 3;
        let evicted = store.evict_oldest_until(per_entry * 2).await;
        assert_eq!(evicted, 1);
        assert!(!store.contains(&key(1)).await);
        assert!(store.contains(&key(3)).await);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invalidations, 1);
        assert_eq!(snapshot.evictions, 1);
    }

    #[tokio::test]
    async fn test_storage_ceiling_evicts_oldest_on_insert() {
        let clock = ManualClock::new(Timestamp(1_000_000));
        let metrics = Arc::new(CacheMetrics::new());
        let sample = CacheEntry::new(key(0), "x".repeat(100), Vec::new(), clock.now());
        let options = CacheOptions {
            max_entries: 10,
            max_storage_bytes: sample.size_bytes * 2,
            ..Default::default()
        };
        let store: EntryStore<String> =
            EntryStore::new(&options, None, metrics.clone(), Arc::new(clock.clone()));

        for n in 0..4 {
            store.insert(key(n), "x".repeat(100), Vec::new()).await;
            clock.advance(Duration::from_millis(10));
        }

        assert_eq!(store.len().await, 2);
        assert!(!store.contains(&key(0)).await);
        assert!(!store.contains(&key(1)).await);
        assert!(store.contains(&key(3)).await);
        assert!(store.storage_size().await <= options.max_storage_bytes);
        assert_eq!(metrics.snapshot().evictions, 2);

        // An entry larger than the ceiling on its own is still stored.
        store.insert(key(9), "y".repeat(1_000), Vec::new()).await;
        assert_eq!(store.len().await, 1);
        assert!(store.contains(&key(9)).await);
    }

    #[tokio::test]
    async fn test_peek_does_not_count_or_touch() {
        let (store, clock, metrics) = store_with(10, Duration::from_millis(1_000), None);
        store.insert(key(1), "a".to_string(), Vec::new()).await;

        assert_eq!(store.peek(&key(1)).await.as_deref(), Some("a"));
        assert_eq!(store.peek(&key(2)).await, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.misses, 0);

        clock.advance(Duration::from_millis(1_001));
        assert_eq!(store.peek(&key(1)).await, None);
        // Expired entries are left for the next lookup to drop.
        assert!(store.contains(&key(1)).await);
    }

    #[tokio::test]
    async fn test_persisted_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let ttl = Duration::from_secs(60);

        let (store, _clock, metrics) =
            store_with(10, ttl, Some(DiskPersistence::new(temp_dir.path())));
        store.insert(key(1), "a".to_string(), Vec::new()).await;
        store.insert(key(2), "b".to_string(), Vec::new()).await;
        assert!(metrics.snapshot().storage_size > 0);

        let (reopened, _clock, metrics) =
            store_with(10, ttl, Some(DiskPersistence::new(temp_dir.path())));
        assert_eq!(reopened.load().await, 2);
        assert_eq!(metrics.snapshot().size, 2);
        assert_eq!(reopened.lookup(&key(2)).await.into_value().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_load_respects_shrunk_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let ttl = Duration::from_secs(60);

        let (store, clock, _metrics) =
            store_with(10, ttl, Some(DiskPersistence::new(temp_dir.path())));
        for n in 0..4 {
            store.insert(key(n), "v".to_string(), Vec::new()).await;
            clock.advance(Duration::from_millis(1));
        }

        let (reopened, _clock, metrics) =
            store_with(2, ttl, Some(DiskPersistence::new(temp_dir.path())));
        assert_eq!(reopened.load().await, 2);
        assert!(reopened.contains(&key(3)).await);
        assert_eq!(metrics.snapshot().evictions, 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _clock, metrics) = store_with(10, Duration::from_secs(60), None);
        store.insert(key(1), "a".to_string(), Vec::new()).await;
        store.insert(key(2), "b".to_string(), Vec::new()).await;

        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty().await);
        assert!(!store.remove(&key(1)).await);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.size, 0);
        assert_eq!(snapshot.invalidations, 2);
        assert_eq!(snapshot.storage_size, 0);
    }
}
