//! Configuration types for the codeassist response cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings file: cache options plus invalidation policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub cache: CacheOptions,
    pub invalidation: InvalidationConfig,
}

impl CacheSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading cache settings");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.persist && self.cache.cache_dir.is_none() {
            return Err(CacheError::Config(
                "persistence enabled without a cache directory".to_string(),
            ));
        }
        if self.invalidation.enabled && self.invalidation.sweep_interval.is_zero() {
            return Err(CacheError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response cache options, fixed for the lifetime of a cache instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Maximum resident entries; zero disables storage
    pub max_entries: usize,

    /// Entry time-to-live
    #[serde(with = "duration_millis")]
    pub ttl: Duration,

    /// Persist entries to `cache_dir`
    pub persist: bool,

    /// Directory holding the entry files and the index
    pub cache_dir: Option<PathBuf>,

    /// On-disk storage ceiling in bytes
    pub max_storage_bytes: u64,

    /// Signal the refresh hook for hot entries nearing expiry
    pub background_refresh: bool,

    /// Minimum access count before an entry counts as hot
    pub refresh_threshold: u64,

    /// Delay between scheduling a refresh and firing the hook
    #[serde(with = "duration_millis")]
    pub refresh_delay: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
            persist: false,
            cache_dir: None,
            max_storage_bytes: 100 * 1024 * 1024, // 100MB
            background_refresh: false,
            refresh_threshold: 5,
            refresh_delay: Duration::from_secs(1),
        }
    }
}

impl CacheOptions {
    /// In-memory only, small footprint
    pub fn minimal() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(60 * 60),
            max_storage_bytes: 10 * 1024 * 1024, // 10MB
            ..Default::default()
        }
    }

    /// Large persistent cache with background refresh
    pub fn performance(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_entries: 5000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            persist: true,
            cache_dir: Some(cache_dir.into()),
            max_storage_bytes: 500 * 1024 * 1024, // 500MB
            background_refresh: true,
            refresh_threshold: 3,
            ..Default::default()
        }
    }

    /// Directory to persist to, if persistence is enabled and configured
    pub fn persistence_dir(&self) -> Option<&Path> {
        if self.persist {
            self.cache_dir.as_deref()
        } else {
            None
        }
    }
}

/// What the periodic sweep does once the storage ceiling is exceeded
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePressurePolicy {
    /// Drop the whole cache
    #[default]
    ClearAll,
    /// Drop oldest entries until back under the ceiling
    EvictOldest,
}

/// Invalidation policy, independent from [`CacheOptions`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub enabled: bool,

    /// Interval of the periodic sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Maximum entry age enforced by the sweep
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    pub watch_files: bool,
    pub watch_config: bool,

    /// Workspace roots; file events outside of them are ignored
    pub workspace_roots: Vec<PathBuf>,

    /// Glob patterns a changed path must match
    pub watch_patterns: Vec<String>,

    /// Directory names that are never watched (build output, dependencies)
    pub excluded_dirs: Vec<String>,

    /// File extensions (without dot) that count as source files
    pub source_extensions: Vec<String>,

    /// Preference namespaces whose changes clear the cache
    pub config_namespaces: Vec<String>,

    /// On-disk storage ceiling in bytes
    pub max_storage_bytes: u64,

    pub storage_policy: StoragePressurePolicy,

    pub invalidate_on_app_update: bool,

    /// Manifest files hashed into the application version fingerprint,
    /// relative paths resolve against the first workspace root
    pub manifest_files: Vec<PathBuf>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(5 * 60),
            ttl: Duration::from_secs(24 * 60 * 60),
            watch_files: true,
            watch_config: true,
            workspace_roots: Vec::new(),
            watch_patterns: vec!["**/*".to_string()],
            excluded_dirs: ["node_modules", "target", "dist", "build", "out", ".git"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            source_extensions: [
                "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "c",
                "cc", "cpp", "h", "hpp", "cs", "rb", "php", "swift", "scala", "json", "toml",
                "yaml", "yml", "md",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            config_namespaces: vec!["codeassist".to_string()],
            max_storage_bytes: 100 * 1024 * 1024, // 100MB
            storage_policy: StoragePressurePolicy::default(),
            invalidate_on_app_update: true,
            manifest_files: ["Cargo.toml", "Cargo.lock", "package.json", "package-lock.json"]
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl InvalidationConfig {
    /// Coordinator that only reacts to explicit signals, never on a timer
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// Serde helpers for Duration
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
