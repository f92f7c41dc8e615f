//! Cache entries

use crate::fingerprint::CacheKey;
use codeassist_core::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Payloads the cache can hold.
///
/// Values are cloned on the way in and on the way out, so a caller mutating
/// its copy can never corrupt the cached one.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Stored entry, exclusively owned by the entry store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub access_count: u64,

    /// Absolute paths whose modification makes this entry stale
    #[serde(default)]
    pub file_dependencies: Vec<PathBuf>,

    /// Approximate serialized size in bytes
    #[serde(skip)]
    pub size_bytes: u64,
}

impl<V: CacheValue> CacheEntry<V> {
    /// A fresh entry, counted as accessed once
    pub fn new(key: CacheKey, value: V, file_dependencies: Vec<PathBuf>, now: Timestamp) -> Self {
        let mut entry = Self {
            key,
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            file_dependencies,
            size_bytes: 0,
        };
        entry.size_bytes = entry.measure();
        entry
    }

    /// Serialized size, used for storage accounting
    pub fn measure(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

impl<V> CacheEntry<V> {
    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.created_at)
    }

    /// Strictly older than `ttl`; an entry exactly `ttl` old is still live
    pub fn is_expired(&self, ttl: Duration, now: Timestamp) -> bool {
        self.age(now) > ttl
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.last_accessed = self.last_accessed.max(now);
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            key: self.key,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
        }
    }
}

/// Whether a change to `changed` affects `dependency`
pub fn dependency_matches(dependency: &Path, changed: &Path) -> bool {
    dependency == changed || dependency.starts_with(changed)
}

/// Metadata snapshot handed out alongside a hit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub access_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_value;
    use serde_json::json;

    fn entry(deps: Vec<PathBuf>) -> CacheEntry<String> {
        let key = fingerprint_value(&json!({"prompt": "hi"}));
        CacheEntry::new(key, "hello".to_string(), deps, Timestamp(1_000))
    }

    #[test]
    fn test_new_entry_counts_one_access() {
        let entry = entry(Vec::new());
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.created_at, entry.last_accessed);
        assert!(entry.size_bytes > 0);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = entry(Vec::new());
        let ttl = Duration::from_millis(500);

        assert!(!entry.is_expired(ttl, Timestamp(1_499)));
        assert!(!entry.is_expired(ttl, Timestamp(1_500)));
        assert!(entry.is_expired(ttl, Timestamp(1_501)));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut entry = entry(Vec::new());
        entry.touch(Timestamp(2_000));
        entry.touch(Timestamp(1_500));

        assert_eq!(entry.last_accessed, Timestamp(2_000));
        assert_eq!(entry.access_count, 3);
    }

    #[test]
    fn test_dependency_matches() {
        let dep = Path::new("/ws/src/lib.rs");

        assert!(dependency_matches(dep, Path::new("/ws/src/lib.rs")));
        assert!(dependency_matches(dep, Path::new("/ws/src")));
        assert!(!dependency_matches(dep, Path::new("/ws/src/main.rs")));
        assert!(!dependency_matches(dep, Path::new("/ws/src/lib")));
    }
}
