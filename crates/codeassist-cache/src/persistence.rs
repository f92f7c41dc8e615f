//! On-disk persistence for the entry store
//!
//! Layout of the cache directory:
//!
//! ```text
//! <cache_dir>/
//!   index.json          { "version": 1, "entries": { "<key hex>": "<key hex>.json" } }
//!   <key hex>.json      one serialized CacheEntry per file
//! ```
//!
//! Every save rewrites the index and all entry files and removes files that no
//! longer belong to an entry. Failures are logged and never propagate: a broken
//! disk degrades the cache to in-memory only.

use crate::entry::{CacheEntry, CacheValue};
use crate::fingerprint::CacheKey;
use codeassist_core::{CacheError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    /// Key hex -> entry file name
    entries: BTreeMap<String, String>,
}

/// Result of loading a cache directory
#[derive(Debug)]
pub struct LoadOutcome<V> {
    pub entries: Vec<CacheEntry<V>>,
    /// Entries dropped because they were already past their TTL
    pub expired: usize,
    /// Entries skipped because they could not be read or parsed
    pub skipped: usize,
}

impl<V> Default for LoadOutcome<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            expired: 0,
            skipped: 0,
        }
    }
}

/// File-per-entry persistence rooted at one directory
#[derive(Clone, Debug)]
pub struct DiskPersistence {
    dir: PathBuf,
}

impl DiskPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Load all entries, discarding (and deleting) those already expired.
    ///
    /// A missing or unreadable index yields an empty cache.
    pub async fn load<V: CacheValue>(&self, ttl: Duration, now: Timestamp) -> LoadOutcome<V> {
        match self.try_load(ttl, now).await {
            Ok(outcome) => {
                tracing::info!(
                    dir = %self.dir.display(),
                    loaded = outcome.entries.len(),
                    expired = outcome.expired,
                    skipped = outcome.skipped,
                    "Loaded response cache from disk"
                );
                outcome
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(dir = %self.dir.display(), "No persisted cache index");
                LoadOutcome::default()
            }
            Err(e) => {
                tracing::error!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Failed to load cache index, starting empty"
                );
                LoadOutcome::default()
            }
        }
    }

    async fn try_load<V: CacheValue>(&self, ttl: Duration, now: Timestamp) -> Result<LoadOutcome<V>> {
        let data = tokio::fs::read(self.index_path()).await?;
        let index: CacheIndex = serde_json::from_slice(&data)?;
        if index.version != INDEX_VERSION {
            return Err(CacheError::CorruptEntry {
                key: INDEX_FILE.to_string(),
                reason: format!("unsupported index version {}", index.version),
            });
        }

        let mut outcome = LoadOutcome::default();
        for (key_hex, file_name) in &index.entries {
            let entry = match self.load_entry::<V>(key_hex, file_name).await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key = %key_hex, error = %e, "Skipping unreadable cache entry");
                    outcome.skipped += 1;
                    continue;
                }
            };

            if entry.is_expired(ttl, now) {
                tracing::debug!(key = %entry.key, "Discarding expired cache entry");
                self.remove_file(&self.dir.join(file_name)).await;
                outcome.expired += 1;
                continue;
            }

            outcome.entries.push(entry);
        }

        Ok(outcome)
    }

    async fn load_entry<V: CacheValue>(&self, key_hex: &str, file_name: &str) -> Result<CacheEntry<V>> {
        let key: CacheKey = key_hex.parse()?;
        if file_name != key.file_name() {
            return Err(CacheError::CorruptEntry {
                key: key_hex.to_string(),
                reason: format!("unexpected file name {file_name}"),
            });
        }

        let data = tokio::fs::read(self.dir.join(file_name)).await?;
        let mut entry: CacheEntry<V> =
            serde_json::from_slice(&data).map_err(|e| CacheError::CorruptEntry {
                key: key_hex.to_string(),
                reason: e.to_string(),
            })?;

        if entry.key != key {
            return Err(CacheError::CorruptEntry {
                key: key_hex.to_string(),
                reason: format!("file holds entry for {}", entry.key),
            });
        }

        entry.size_bytes = data.len() as u64;
        Ok(entry)
    }

    /// Rewrite the index and every entry file.
    ///
    /// Returns the number of bytes now on disk, or `None` if the save failed
    /// and was skipped for this cycle.
    pub async fn save<V: CacheValue>(&self, entries: &HashMap<CacheKey, CacheEntry<V>>) -> Option<u64> {
        match self.try_save(entries).await {
            Ok(bytes) => {
                tracing::trace!(entries = entries.len(), bytes, "Saved response cache");
                Some(bytes)
            }
            Err(e) => {
                tracing::error!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Failed to save response cache, continuing in memory"
                );
                None
            }
        }
    }

    async fn try_save<V: CacheValue>(&self, entries: &HashMap<CacheKey, CacheEntry<V>>) -> Result<u64> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut index = CacheIndex {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        };
        let mut keep = HashSet::with_capacity(entries.len() + 1);
        let mut total = 0u64;

        for entry in entries.values() {
            let file_name = entry.key.file_name();
            let data = serde_json::to_vec(entry)?;
            write_atomic(&self.dir.join(&file_name), &data).await?;

            total += data.len() as u64;
            index.entries.insert(entry.key.to_hex(), file_name.clone());
            keep.insert(file_name);
        }

        let data = serde_json::to_vec_pretty(&index)?;
        write_atomic(&self.index_path(), &data).await?;
        total += data.len() as u64;
        keep.insert(INDEX_FILE.to_string());

        self.remove_orphans(&keep).await?;
        Ok(total)
    }

    /// Delete entry files (and stray temporaries) not referenced by the index.
    ///
    /// Files this layer never writes are left alone.
    async fn remove_orphans(&self, keep: &HashSet<String>) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if is_cache_file(&name) && !keep.contains(&name) {
                self.remove_file(&item.path()).await;
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }

    /// Total size of the index and entry files in the cache directory
    pub async fn storage_size(&self) -> u64 {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return 0,
        };

        let mut total = 0;
        loop {
            match dir.next_entry().await {
                Ok(Some(item)) => {
                    if !is_cache_file(&item.file_name().to_string_lossy()) {
                        continue;
                    }
                    if let Ok(meta) = item.metadata().await {
                        if meta.is_file() {
                            total += meta.len();
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to scan cache directory");
                    break;
                }
            }
        }
        total
    }
}

/// Index, entry file (`<key>.json`) or a temporary of either
fn is_cache_file(name: &str) -> bool {
    let name = name.strip_suffix(TMP_SUFFIX).unwrap_or(name);
    name == INDEX_FILE
        || name
            .strip_suffix(".json")
            .is_some_and(|stem| stem.parse::<CacheKey>().is_ok())
}

/// Write to a sibling temporary file, then move it into place
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
